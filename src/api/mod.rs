//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - Well-known discovery and ACME HTTP-01
//! - Alternate-domain routing
//! - Operator API
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
mod alt_domain;
pub mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use admin::admin_router;
pub use alt_domain::{
    alt_domain_redirect, canonical_location, redirect_to_https, serves_on_alternate,
};
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;

/// Largest accepted request body (inbox deliveries included)
pub const MAX_BODY_BYTES: usize = 1024 * 1024;
