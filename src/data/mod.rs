//! Data layer module
//!
//! Handles all data persistence:
//! - settings key/value store
//! - persistent blob cache (certificates, instance key)
//! - followers
//! - durable queue

mod database;
mod models;

pub use database::Database;
pub use models::*;
