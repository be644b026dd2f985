//! ACME issuance
//!
//! Orders certificates through `instant-acme`. Pending challenges are kept in
//! a [`ChallengeStore`] that the TLS acceptor (TLS-ALPN-01) and the HTTP
//! router (HTTP-01) read from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, ExternalAccountKey,
    Identifier, NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::Mutex;

use crate::config::{ChallengeKind, TlsConfig};
use crate::data::{ACME_ACCOUNT_KEY, Database};
use crate::error::AppError;

/// ALPN protocol of TLS-ALPN-01 validation handshakes
pub const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";

fn rcgen_error(error: rcgen::Error) -> AppError {
    AppError::Tls(format!("Certificate generation failed: {}", error))
}

/// Produces a fresh key-first PEM bundle for a host
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertIssuer: Send + Sync {
    async fn issue(&self, host: &str) -> Result<Vec<u8>, AppError>;
}

/// Challenge responses waiting for validation
#[derive(Default)]
pub struct ChallengeStore {
    tls_alpn: DashMap<String, Arc<CertifiedKey>>,
    http: DashMap<String, String>,
}

impl std::fmt::Debug for ChallengeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeStore")
            .field("tls_alpn", &self.tls_alpn.len())
            .field("http", &self.http.len())
            .finish()
    }
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the self-signed validation certificate for `host`
    pub fn present_tls_alpn(&self, host: &str, key_authorization_digest: &[u8]) -> Result<(), AppError> {
        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(rcgen_error)?;
        params.distinguished_name = DistinguishedName::new();
        params.custom_extensions = vec![CustomExtension::new_acme_identifier(
            key_authorization_digest,
        )];
        let key_pair = KeyPair::generate().map_err(rcgen_error)?;
        let cert = params.self_signed(&key_pair).map_err(rcgen_error)?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        let certified = CertifiedKey::new(vec![CertificateDer::from(cert.der().to_vec())], signing_key);

        self.tls_alpn
            .insert(host.to_ascii_lowercase(), Arc::new(certified));
        tracing::debug!(%host, "TLS-ALPN-01 challenge presented");
        Ok(())
    }

    pub fn present_http(&self, token: &str, key_authorization: &str) {
        self.http
            .insert(token.to_string(), key_authorization.to_string());
        tracing::debug!(%token, "HTTP-01 challenge presented");
    }

    pub fn tls_alpn_certificate(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        self.tls_alpn
            .get(&host.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
    }

    pub fn http_response(&self, token: &str) -> Option<String> {
        self.http.get(token).map(|entry| entry.value().clone())
    }

    pub fn clear_tls_alpn(&self, host: &str) {
        self.tls_alpn.remove(&host.to_ascii_lowercase());
    }

    pub fn clear_http(&self, token: &str) {
        self.http.remove(token);
    }
}

/// A challenge we answered and have to clean up
enum Presented {
    TlsAlpn(String),
    Http(String),
}

/// ACME client bound to one directory
pub struct AcmeIssuer {
    db: Arc<Database>,
    directory_url: String,
    challenge: ChallengeKind,
    contact_email: Option<String>,
    eab: Option<(String, String)>,
    timeout: Duration,
    challenges: Arc<ChallengeStore>,
    account: Mutex<Option<Account>>,
}

impl AcmeIssuer {
    pub fn new(db: Arc<Database>, config: &TlsConfig, challenges: Arc<ChallengeStore>) -> Self {
        let eab = match (&config.eab_kid, &config.eab_hmac_key) {
            (Some(kid), Some(hmac)) if !kid.is_empty() && !hmac.is_empty() => {
                Some((kid.clone(), hmac.clone()))
            }
            _ => None,
        };

        Self {
            db,
            directory_url: config.directory_url.clone(),
            challenge: config.challenge,
            contact_email: config.contact_email.clone(),
            eab,
            timeout: Duration::from_secs(config.issuance_timeout_secs.max(1)),
            challenges,
            account: Mutex::new(None),
        }
    }

    /// Restore the persisted account or register a new one
    async fn account(&self) -> Result<Account, AppError> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(account.clone());
        }

        if let Some(stored) = self.db.get_setting(ACME_ACCOUNT_KEY).await? {
            match serde_json::from_str::<AccountCredentials>(&stored) {
                Ok(credentials) => {
                    let account = Account::from_credentials(credentials).await?;
                    tracing::info!(directory = %self.directory_url, "Restored ACME account");
                    *slot = Some(account.clone());
                    return Ok(account);
                }
                Err(error) => {
                    tracing::warn!(%error, "Stored ACME account is unreadable, registering a new one");
                }
            }
        }

        let contact = self
            .contact_email
            .as_ref()
            .map(|email| format!("mailto:{}", email));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        let eab = match &self.eab {
            Some((kid, hmac)) => {
                let key = base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(hmac.trim_end_matches('='))
                    .map_err(|e| AppError::Config(format!("tls.eab_hmac_key is not base64url: {}", e)))?;
                Some(ExternalAccountKey::new(kid.clone(), &key))
            }
            None => None,
        };

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            eab.as_ref(),
        )
        .await?;

        let serialized = serde_json::to_string(&credentials)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize ACME account: {}", e)))?;
        self.db.set_setting(ACME_ACCOUNT_KEY, &serialized).await?;
        tracing::info!(directory = %self.directory_url, "Registered ACME account");

        *slot = Some(account.clone());
        Ok(account)
    }

    async fn order(&self, host: &str, presented: &mut Vec<Presented>) -> Result<Vec<u8>, AppError> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let wanted = match self.challenge {
            ChallengeKind::TlsAlpn01 => ChallengeType::TlsAlpn01,
            ChallengeKind::Http01 => ChallengeType::Http01,
        };

        let authorizations = order.authorizations().await?;
        for authorization in &authorizations {
            match authorization.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AppError::Acme(format!(
                        "Authorization for {} is {:?}",
                        host, status
                    )));
                }
            }

            #[allow(unreachable_patterns)]
            let domain = match &authorization.identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => return Err(AppError::Acme("Unsupported identifier".to_string())),
            };
            let challenge = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == wanted)
                .ok_or_else(|| {
                    AppError::Acme(format!("No {:?} challenge offered for {}", wanted, domain))
                })?;

            let key_authorization = order.key_authorization(challenge);
            match self.challenge {
                ChallengeKind::TlsAlpn01 => {
                    self.challenges
                        .present_tls_alpn(&domain, key_authorization.digest().as_ref())?;
                    presented.push(Presented::TlsAlpn(domain.clone()));
                }
                ChallengeKind::Http01 => {
                    self.challenges
                        .present_http(&challenge.token, key_authorization.as_str());
                    presented.push(Presented::Http(challenge.token.clone()));
                }
            }
            order.set_challenge_ready(&challenge.url).await?;
        }

        let mut delay = Duration::from_millis(250);
        loop {
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    return Err(AppError::Acme(format!("Order for {} became invalid", host)));
                }
                _ => {}
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(5));
        }

        let key_pair = KeyPair::generate().map_err(rcgen_error)?;
        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(rcgen_error)?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair).map_err(rcgen_error)?;
        order.finalize(csr.der()).await?;

        let chain = loop {
            if let Some(chain) = order.certificate().await? {
                break chain;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        };

        let mut bundle = key_pair.serialize_pem().into_bytes();
        bundle.extend_from_slice(chain.as_bytes());
        Ok(bundle)
    }
}

#[async_trait]
impl CertIssuer for AcmeIssuer {
    async fn issue(&self, host: &str) -> Result<Vec<u8>, AppError> {
        let mut presented = Vec::new();
        let result = tokio::time::timeout(self.timeout, self.order(host, &mut presented)).await;

        for challenge in presented {
            match challenge {
                Presented::TlsAlpn(domain) => self.challenges.clear_tls_alpn(&domain),
                Presented::Http(token) => self.challenges.clear_http(&token),
            }
        }

        match result {
            Ok(bundle) => bundle,
            Err(_) => Err(AppError::Acme(format!(
                "Issuance for {} timed out after {}s",
                host,
                self.timeout.as_secs()
            ))),
        }
    }
}
