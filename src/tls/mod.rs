//! Automatic TLS
//!
//! - PEM bundles in the legacy autocert cache layout
//! - ACME issuance (TLS-ALPN-01 or HTTP-01)
//! - Certificate manager with renewal
//! - HTTPS listener

mod acme;
mod bundle;
mod listener;
mod manager;

pub use acme::{ACME_TLS_ALPN, AcmeIssuer, CertIssuer, ChallengeStore};
pub use bundle::CertBundle;
pub use listener::{serve_tls, server_config};
pub use manager::{CertManager, host_allowlist};
