//! WebFinger protocol implementation
//!
//! Serves JRD documents for local blogs and resolves remote handles to
//! ActivityPub actor IRIs.

use serde::{Deserialize, Serialize};

use super::actor::{ACTIVITY_JSON, BlogIris, find_local_actor};
use crate::config::{AppConfig, normalize_host};
use crate::error::AppError;

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl WebFingerResponse {
    /// `href` of the ActivityPub `self` link
    pub fn self_link(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|link| {
                link.rel == "self"
                    && link
                        .link_type
                        .as_deref()
                        .is_some_and(|t| t.contains("activity+json") || t.contains("ld+json"))
            })
            .and_then(|link| link.href.as_deref())
    }
}

/// Find the blog and serving host a `resource` parameter refers to.
///
/// Accepts `acct:<blog>@<host>` for the canonical, alternate and short hosts,
/// and the actor IRI itself. The short host maps to the canonical actor.
pub fn lookup_resource(config: &AppConfig, resource: &str) -> Option<BlogIris> {
    if let Some(acct) = resource.strip_prefix("acct:") {
        let acct = acct.trim_start_matches('@');
        let (user, host) = acct.rsplit_once('@')?;
        let host = normalize_host(host);
        config.blog(user)?;

        let canonical = config.server.canonical_host();
        let serving_host = if host == canonical || config.server.is_alternate_host(&host) {
            host
        } else if config.server.short_host().as_deref() == Some(host.as_str()) {
            canonical
        } else {
            return None;
        };
        return BlogIris::new(config, user, &serving_host);
    }

    find_local_actor(config, resource)
}

/// Generate the JRD for a blog served on `iris.host`.
///
/// `aliases` carry the canonical actor IRI and the host-specific one.
pub fn generate_webfinger_response(config: &AppConfig, iris: &BlogIris) -> WebFingerResponse {
    let subject = format!("acct:{}@{}", iris.blog, iris.host);

    let mut aliases = Vec::new();
    if let Some(canonical) = BlogIris::canonical(config, &iris.blog) {
        aliases.push(canonical.actor);
    }
    if !aliases.contains(&iris.actor) {
        aliases.push(iris.actor.clone());
    }

    WebFingerResponse {
        subject,
        aliases,
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(iris.actor.clone()),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(iris.actor.clone()),
                template: None,
            },
        ],
    }
}

/// Split `@user@host`, `user@host` or `acct:user@host`
pub fn parse_handle(handle: &str) -> Option<(String, String)> {
    let handle = handle.trim();
    let handle = handle.strip_prefix("acct:").unwrap_or(handle);
    let handle = handle.trim_start_matches('@');
    let (user, host) = handle.split_once('@')?;
    if user.is_empty() || host.is_empty() || host.contains('@') || host.contains('/') {
        return None;
    }
    Some((user.to_string(), normalize_host(host)))
}

/// Resolve a handle to its ActivityPub actor IRI
///
/// # Example
/// ```ignore
/// let actor = resolve_webfinger("@alice@peer.example", &client).await?;
/// ```
pub async fn resolve_webfinger(
    handle: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    let (user, host) = parse_handle(handle)
        .ok_or_else(|| AppError::Validation(format!("Invalid handle: {}", handle)))?;
    let resource = format!("acct:{}@{}", user, host);
    let url = format!(
        "https://{}/.well-known/webfinger?resource={}",
        host,
        urlencoding::encode(&resource)
    );

    let response = http_client
        .get(&url)
        .header("Accept", "application/jrd+json, application/json")
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("WebFinger request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "WebFinger for {} returned HTTP {}",
            resource,
            response.status()
        )));
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("Invalid WebFinger response: {}", e)))?;

    jrd.self_link()
        .map(str::to_string)
        .ok_or_else(|| AppError::Federation(format!("No ActivityPub link for {}", resource)))
}
