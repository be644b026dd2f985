//! Remote actor fetching and caching
//!
//! Actor documents are fetched with a signed GET (authorized-fetch peers
//! require it) and cached for `actor_cache_ttl_secs`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use super::actor::{ACTIVITY_JSON, LD_JSON};
use super::signature::{InstanceKey, key_owner, sign_request};
use crate::error::AppError;
use crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS;

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Parse a remote URL and reject non-HTTP(S) schemes and local destinations
async fn check_remote_url(url: &str, allow_private: bool) -> Result<url::Url, AppError> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
        .to_string();

    if !allow_private {
        if is_disallowed_host(&host) {
            return Err(AppError::Forbidden);
        }
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
        validate_resolved_host_ips(&host, port).await?;
    }

    Ok(parsed)
}

/// The parts of a remote actor document the core uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActor {
    pub id: String,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub public_key_id: Option<String>,
    pub public_key_pem: Option<String>,
    pub preferred_username: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub also_known_as: Vec<String>,
    pub moved_to: Option<String>,
}

impl RemoteActor {
    /// Inbox to deliver to: the shared inbox when advertised
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox.as_deref().unwrap_or(&self.inbox)
    }

    /// Display handle `@user@host`, or the IRI when no username is known
    pub fn handle(&self) -> String {
        let host = url::Url::parse(&self.id)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        match (&self.preferred_username, host) {
            (Some(user), Some(host)) => format!("@{}@{}", user, host),
            _ => self.id.clone(),
        }
    }

    pub fn knows_alias(&self, iri: &str) -> bool {
        let iri = iri.trim_end_matches('/');
        self.also_known_as
            .iter()
            .any(|alias| alias.trim_end_matches('/') == iri)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActor {
    id: String,
    inbox: String,
    #[serde(default)]
    endpoints: Option<RawEndpoints>,
    #[serde(default)]
    public_key: Option<RawPublicKey>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<serde_json::Value>,
    #[serde(default)]
    also_known_as: Option<serde_json::Value>,
    #[serde(default)]
    moved_to: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEndpoints {
    #[serde(default)]
    shared_inbox: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPublicKey {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    public_key_pem: Option<String>,
}

/// Strings of a JSON value that is either a string or an array of strings/objects with `id`
pub fn iri_list(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s.clone()),
                other => other.get("id").and_then(|id| id.as_str()).map(str::to_string),
            })
            .collect(),
        Some(other) => other
            .get("id")
            .and_then(|id| id.as_str())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Parse an actor document
pub fn parse_actor(document: &serde_json::Value) -> Result<RemoteActor, AppError> {
    let raw: RawActor = serde_json::from_value(document.clone())
        .map_err(|e| AppError::Federation(format!("Invalid actor document: {}", e)))?;

    let url = match raw.url {
        Some(serde_json::Value::String(s)) => Some(s),
        other => iri_list(other.as_ref()).into_iter().next(),
    };

    Ok(RemoteActor {
        id: raw.id,
        inbox: raw.inbox,
        shared_inbox: raw
            .endpoints
            .and_then(|e| e.shared_inbox)
            .filter(|s| !s.is_empty()),
        public_key_id: raw.public_key.as_ref().and_then(|k| k.id.clone()),
        public_key_pem: raw.public_key.and_then(|k| k.public_key_pem),
        preferred_username: raw.preferred_username,
        name: raw.name,
        url,
        also_known_as: iri_list(raw.also_known_as.as_ref()),
        moved_to: raw.moved_to,
    })
}

/// Cached actor entry
#[derive(Debug, Clone)]
struct CachedActor {
    actor: RemoteActor,
    cached_at: Instant,
}

/// Fetcher and TTL cache for remote actors, keyed by actor IRI
pub struct RemoteActors {
    cache: Arc<RwLock<HashMap<String, CachedActor>>>,
    http_client: reqwest::Client,
    key: Arc<InstanceKey>,
    /// keyId used to sign fetches
    key_id: String,
    ttl: Duration,
    allow_private_addresses: bool,
}

impl RemoteActors {
    pub fn new(
        http_client: reqwest::Client,
        key: Arc<InstanceKey>,
        key_id: String,
        ttl: Duration,
        allow_private_addresses: bool,
    ) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            http_client,
            key,
            key_id,
            ttl,
            allow_private_addresses,
        }
    }

    /// Actor by IRI, from cache when fresh
    pub async fn get(&self, iri: &str) -> Result<RemoteActor, AppError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(iri) {
                if cached.cached_at.elapsed() < self.ttl {
                    tracing::debug!(actor = %iri, "Remote actor cache hit");
                    return Ok(cached.actor.clone());
                }
            }
        }

        self.refresh(iri).await
    }

    /// Fetch an actor bypassing the cache, then cache it
    pub async fn refresh(&self, iri: &str) -> Result<RemoteActor, AppError> {
        let document = self.fetch_object(iri).await?;
        let actor = parse_actor(&document)?;

        let mut cache = self.cache.write().await;
        cache.insert(
            iri.to_string(),
            CachedActor {
                actor: actor.clone(),
                cached_at: Instant::now(),
            },
        );
        if actor.id != iri {
            cache.insert(
                actor.id.clone(),
                CachedActor {
                    actor: actor.clone(),
                    cached_at: Instant::now(),
                },
            );
        }

        Ok(actor)
    }

    /// Public key PEM for a signature keyId
    ///
    /// With `fresh`, the cached actor is skipped (the signer may have rotated its key).
    pub async fn public_key(&self, key_id: &str, fresh: bool) -> Result<(RemoteActor, String), AppError> {
        let owner = key_owner(key_id);
        let actor = if fresh {
            self.refresh(owner).await?
        } else {
            self.get(owner).await?
        };

        if key_id.contains('#') {
            if let Some(advertised) = actor.public_key_id.as_deref() {
                if advertised != key_id {
                    return Err(AppError::InvalidSignature(
                        "Signature keyId does not match actor public key id".to_string(),
                    ));
                }
            }
        }

        let pem = actor
            .public_key_pem
            .clone()
            .ok_or_else(|| AppError::InvalidSignature("Missing publicKeyPem in actor".to_string()))?;
        Ok((actor, pem))
    }

    /// Signed GET of an ActivityStreams object
    ///
    /// # Errors
    /// - `Permanent` for 404 and 410
    /// - `Federation` for other failures
    pub async fn fetch_object(&self, iri: &str) -> Result<serde_json::Value, AppError> {
        let parsed = check_remote_url(iri, self.allow_private_addresses).await?;
        let signed = sign_request("GET", parsed.as_str(), None, &self.key, &self.key_id)?;

        let timer = FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["fetch"])
            .start_timer();
        let response = self
            .http_client
            .get(parsed.as_str())
            .header("Accept", format!("{}, {}", ACTIVITY_JSON, LD_JSON))
            .header("Date", signed.date)
            .header("Signature", signed.signature)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", iri, e)));
        timer.observe_duration();
        let response = response?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(AppError::Permanent(format!("{} returned HTTP {}", iri, status)));
        }
        if !status.is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                iri, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", iri, e)))
    }

    /// Drop a cached actor (on `Update{Actor}` or a failed signature)
    pub async fn invalidate(&self, iri: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(iri);
        tracing::debug!(actor = %iri, "Invalidated remote actor cache");
    }

    /// Remove expired entries
    pub async fn prune_expired(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!(removed, "Pruned expired remote actor cache entries");
        }
        removed
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn allow_private_addresses(&self) -> bool {
        self.allow_private_addresses
    }

    #[cfg(test)]
    async fn insert_for_test(&self, actor: RemoteActor) {
        self.cache.write().await.insert(
            actor.id.clone(),
            CachedActor {
                actor,
                cached_at: Instant::now(),
            },
        );
    }
}

/// Check a URL against the same guard used for actor fetches
pub async fn ensure_fetchable(url: &str, allow_private: bool) -> Result<(), AppError> {
    check_remote_url(url, allow_private).await.map(|_| ())
}
