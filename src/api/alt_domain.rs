//! Alternate-domain routing
//!
//! Requests on an alternate host keep reaching federation endpoints so the
//! old actor (and its `movedTo`) stays resolvable. Operator endpoints are
//! served too: clients strip the bearer token on a cross-host redirect.
//! Everything else is redirected to the same URI on the canonical host.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::config::ServerConfig;
use crate::federation::wants_activity_json;

/// Path prefixes served as-is on alternate hosts
const PASS_THROUGH_PREFIXES: &[&str] = &[
    "/.well-known/webfinger",
    "/.well-known/host-meta",
    "/.well-known/nodeinfo",
    "/.well-known/acme-challenge/",
    "/activitypub/",
    "/nodeinfo",
    "/admin/",
];

/// Host a request was addressed to (Host header, or the URI authority for HTTP/2)
fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
}

/// Whether a request on an alternate host is served instead of redirected
pub fn serves_on_alternate(path: &str, headers: &HeaderMap) -> bool {
    if PASS_THROUGH_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
    {
        return true;
    }
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(wants_activity_json)
}

/// Redirect target on the canonical host, keeping path and query
pub fn canonical_location(server: &ServerConfig, path_and_query: &str) -> String {
    format!("{}{}", server.base_url(), path_and_query)
}

/// Middleware applying the alternate-domain rules
pub async fn alt_domain_redirect(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let on_alternate = request_host(&request)
        .is_some_and(|host| state.config.server.is_alternate_host(&host));
    if !on_alternate || serves_on_alternate(request.uri().path(), request.headers()) {
        return next.run(request).await;
    }

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = canonical_location(&state.config.server, path_and_query);
    tracing::debug!(%location, "Redirecting alternate-domain request");

    (
        StatusCode::PERMANENT_REDIRECT,
        [(header::LOCATION, location)],
    )
        .into_response()
}

/// Fallback of the plain-HTTP listener when TLS is enabled
pub async fn redirect_to_https(request: Request) -> Response {
    let Some(host) = request_host(&request) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let host = host.split(':').next().unwrap_or_default();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    (
        StatusCode::PERMANENT_REDIRECT,
        [(header::LOCATION, format!("https://{}{}", host, path_and_query))],
    )
        .into_response()
}
