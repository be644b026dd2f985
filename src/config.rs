//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override, `GOBLOG__SECTION__KEY`)
//!
//! The loaded value is an immutable snapshot shared through `AppState`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub blogs: BTreeMap<String, BlogConfig>,
    pub default_blog: String,
    #[serde(default)]
    pub activitypub: ActivityPubConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Plain HTTP port
    pub port: u16,
    /// Canonical address (e.g., "https://goblog.example")
    pub public_address: String,
    /// Retired or secondary hostnames that keep serving ActivityPub
    #[serde(default)]
    pub alternate_domains: Vec<String>,
    /// Optional short-link address (e.g., "https://gobl.og")
    pub short_public_address: Option<String>,
    /// Optional media address served from the same process
    pub media_address: Option<String>,
}

impl ServerConfig {
    /// Scheme of the canonical address ("http" or "https")
    pub fn scheme(&self) -> &str {
        if self.public_address.starts_with("https://") {
            "https"
        } else {
            "http"
        }
    }

    /// Host (with non-default port) of the canonical address
    pub fn canonical_host(&self) -> String {
        authority_of(&self.public_address).unwrap_or_default()
    }

    /// Canonical base URL without trailing slash
    pub fn base_url(&self) -> String {
        self.address_for_host(&self.canonical_host())
    }

    /// Base URL for an arbitrary host, using the canonical scheme
    pub fn address_for_host(&self, host: &str) -> String {
        format!("{}://{}", self.scheme(), host)
    }

    /// Normalized alternate hosts
    pub fn alternate_hosts(&self) -> Vec<String> {
        self.alternate_domains
            .iter()
            .filter_map(|domain| authority_of(domain))
            .collect()
    }

    pub fn short_host(&self) -> Option<String> {
        self.short_public_address.as_deref().and_then(authority_of)
    }

    pub fn media_host(&self) -> Option<String> {
        self.media_address.as_deref().and_then(authority_of)
    }

    pub fn is_alternate_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.alternate_hosts().iter().any(|alt| *alt == host)
    }

    /// Hosts that identify this deployment (canonical, alternates, short)
    pub fn local_hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.canonical_host()];
        hosts.extend(self.alternate_hosts());
        hosts.extend(self.short_host());
        hosts
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// A logical blog served by this instance
#[derive(Debug, Clone, Deserialize)]
pub struct BlogConfig {
    /// Path prefix, "/" for the root blog
    #[serde(default = "default_blog_path")]
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Absolute URL of the profile picture
    pub icon: Option<String>,
}

fn default_blog_path() -> String {
    "/".to_string()
}

fn default_lang() -> String {
    "en".to_string()
}

/// ActivityPub settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivityPubConfig {
    pub enabled: bool,
    /// RSA modulus size for a freshly generated instance key
    pub key_bits: usize,
    /// Extra aliases advertised in every actor's `alsoKnownAs`
    pub also_known_as: Vec<String>,
    /// rel-me links rendered as `PropertyValue` attachments
    pub attachments: Vec<String>,
    pub actor_cache_ttl_secs: u64,
    /// How long inbox notification dedupe keys are kept
    pub notification_retention_days: i64,
    /// Allow fetching actors on loopback/private addresses (tests, LAN setups)
    pub allow_private_addresses: bool,
    /// Send `Update{Person}` to all followers after startup
    pub send_profile_updates: bool,
    pub profile_update_delay_secs: u64,
}

impl Default for ActivityPubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_bits: 2048,
            also_known_as: Vec::new(),
            attachments: Vec::new(),
            actor_cache_ttl_secs: 3600,
            notification_retention_days: 90,
            allow_private_addresses: false,
            send_profile_updates: true,
            profile_update_delay_secs: 10,
        }
    }
}

/// Outbound delivery pipeline settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Sleep when the queue has nothing visible
    pub poll_interval_ms: u64,
    /// Sleep between two processed items
    pub pacing_ms: u64,
    pub max_attempts: u32,
    /// Back-off unit: attempt N is rescheduled by N * retry_step
    pub retry_step_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            pacing_ms: 1000,
            max_attempts: 20,
            retry_step_ms: 10 * 60 * 1000,
            request_timeout_secs: 60,
        }
    }
}

/// ACME challenge flavour
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
pub enum ChallengeKind {
    #[default]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(rename = "http-01")]
    Http01,
}

/// Automatic TLS settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub https_port: u16,
    /// ACME directory URL
    pub directory_url: String,
    pub challenge: ChallengeKind,
    pub contact_email: Option<String>,
    /// External Account Binding key id
    pub eab_kid: Option<String>,
    /// External Account Binding HMAC key (base64url)
    pub eab_hmac_key: Option<String>,
    pub renew_before_days: i64,
    pub issuance_timeout_secs: u64,
    pub renew_check_interval_secs: u64,
}

pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            https_port: 443,
            directory_url: LETS_ENCRYPT_DIRECTORY.to_string(),
            challenge: ChallengeKind::default(),
            contact_email: None,
            eab_kid: None,
            eab_hmac_key: None,
            renew_before_days: 30,
            issuance_timeout_secs: 60,
            renew_check_interval_secs: 3600,
        }
    }
}

/// Operator endpoints
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token; admin routes are not mounted when unset
    pub token: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (GOBLOG__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.public_address", "http://localhost:8080")?
            .set_default("database.path", "data/db.sqlite")?
            .set_default("default_blog", "default")?
            .set_default("blogs.default.path", "/")?
            .set_default("blogs.default.title", "My Blog")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("GOBLOG")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.alternate_domains")
                    .with_list_parse_key("activitypub.also_known_as")
                    .with_list_parse_key("activitypub.attachments")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Look up a blog by name
    pub fn blog(&self, name: &str) -> Option<&BlogConfig> {
        self.blogs.get(name)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        let parsed = url::Url::parse(&self.server.public_address).map_err(|e| {
            AppError::Config(format!("server.public_address is not a valid URL: {}", e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(AppError::Config(
                "server.public_address must be an absolute http(s) URL".to_string(),
            ));
        }

        if self.blogs.is_empty() {
            return Err(AppError::Config(
                "at least one blog must be configured".to_string(),
            ));
        }
        if !self.blogs.contains_key(&self.default_blog) {
            return Err(AppError::Config(format!(
                "default_blog '{}' is not configured",
                self.default_blog
            )));
        }
        for (name, blog) in &self.blogs {
            if !blog.path.starts_with('/') {
                return Err(AppError::Config(format!(
                    "blogs.{}.path must start with '/'",
                    name
                )));
            }
        }

        let canonical = self.server.canonical_host();
        for alternate in &self.server.alternate_domains {
            match authority_of(alternate) {
                Some(host) if host == canonical => {
                    return Err(AppError::Config(format!(
                        "alternate domain {} equals the canonical host",
                        alternate
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(AppError::Config(format!(
                        "alternate domain {} is not a valid host",
                        alternate
                    )));
                }
            }
        }

        if self.tls.enabled && self.server.scheme() != "https" {
            return Err(AppError::Config(
                "tls.enabled requires an https server.public_address".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Lowercased host, without trailing dot
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Extract `host[:port]` from an address or a bare host name.
///
/// Default ports are dropped, so `https://a.example:443/` gives `a.example`.
pub fn authority_of(address: &str) -> Option<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return None;
    }
    let parsed = if trimmed.contains("://") {
        url::Url::parse(trimmed).ok()?
    } else {
        url::Url::parse(&format!("https://{}", trimmed)).ok()?
    };
    let host = normalize_host(parsed.host_str()?);
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}
