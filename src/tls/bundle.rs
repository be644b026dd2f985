//! PEM certificate bundles
//!
//! The cache format is the one autocert writes: the private key block first,
//! then the certificate chain, leaf first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::sign::CertifiedKey;
use rustls_pki_types::pem::{self, PemObject, SectionKind};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::extensions::GeneralName;

use crate::error::AppError;

/// A parsed certificate bundle, ready to be served
#[derive(Debug)]
pub struct CertBundle {
    /// Bundle bytes as stored
    raw: Vec<u8>,
    certified_key: Arc<CertifiedKey>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    dns_names: Vec<String>,
}

impl CertBundle {
    /// Parse a key-first PEM bundle
    ///
    /// # Errors
    /// `Tls` when the first block is not a private key, the chain is empty,
    /// the leaf cannot be parsed or the key does not belong to the leaf
    pub fn parse(data: &[u8]) -> Result<Self, AppError> {
        let mut rest = data;
        let mut key: Option<PrivateKeyDer<'static>> = None;
        let mut chain: Vec<CertificateDer<'static>> = Vec::new();

        loop {
            let mut sections = pem::SliceIter::<(SectionKind, Vec<u8>)>::new(rest);
            let section = sections
                .next()
                .transpose()
                .map_err(|e| AppError::Tls(format!("Invalid PEM in certificate bundle: {:?}", e)))?;
            let Some((kind, der)) = section else {
                break;
            };
            rest = sections.remainder();

            match kind {
                SectionKind::PrivateKey | SectionKind::RsaPrivateKey | SectionKind::EcPrivateKey => {
                    if key.is_some() || !chain.is_empty() {
                        return Err(AppError::Tls(
                            "Private key must be the first block of the bundle".to_string(),
                        ));
                    }
                    key = PrivateKeyDer::from_pem(kind, der);
                }
                SectionKind::Certificate => {
                    if key.is_none() {
                        return Err(AppError::Tls(
                            "Certificate bundle does not start with a private key".to_string(),
                        ));
                    }
                    chain.push(CertificateDer::from(der));
                }
                _ => {}
            }
        }

        let key = key.ok_or_else(|| AppError::Tls("Certificate bundle has no private key".to_string()))?;
        let leaf = chain
            .first()
            .ok_or_else(|| AppError::Tls("Certificate bundle has no certificate".to_string()))?;

        let (not_before, not_after, dns_names) = inspect_leaf(leaf)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        let certified_key = CertifiedKey::new(chain, signing_key);
        certified_key.keys_match().map_err(|e| {
            AppError::Tls(format!("Private key does not match the leaf certificate: {}", e))
        })?;

        Ok(Self {
            raw: data.to_vec(),
            certified_key: Arc::new(certified_key),
            not_before,
            not_after,
            dns_names,
        })
    }

    /// Assemble a bundle from a key PEM and a chain PEM
    pub fn from_parts(key_pem: &str, chain_pem: &str) -> Result<Self, AppError> {
        let mut data = key_pem.trim_end().as_bytes().to_vec();
        data.push(b'\n');
        data.extend_from_slice(chain_pem.as_bytes());
        Self::parse(&data)
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified_key.clone()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Whether the leaf names `host` (exact or single-label wildcard)
    pub fn covers(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.dns_names.iter().any(|name| {
            let name = name.to_ascii_lowercase();
            match name.strip_prefix("*.") {
                Some(suffix) => host
                    .split_once('.')
                    .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
                None => name == host,
            }
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now < self.not_after
    }

    /// Whether the certificate expires within `window` of `now`
    pub fn is_due_at(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.not_after - now <= window
    }
}

fn inspect_leaf(
    leaf: &CertificateDer<'_>,
) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<String>), AppError> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| AppError::Tls(format!("Invalid leaf certificate: {}", e)))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| AppError::Tls("Leaf notBefore out of range".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| AppError::Tls("Leaf notAfter out of range".to_string()))?;

    let dns_names = cert
        .subject_alternative_name()
        .map_err(|e| AppError::Tls(format!("Invalid SAN extension: {}", e)))?
        .map(|san| {
            san.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok((not_before, not_after, dns_names))
}
