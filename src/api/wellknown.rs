//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta
//! - /.well-known/acme-challenge/:token

use axum::{
    Router,
    extract::{Host, Path, Query, State},
    http::header,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{generate_webfinger_response, lookup_resource};

/// NodeInfo schema implemented by `/nodeinfo`
const NODEINFO_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /.well-known/acme-challenge/:token
/// - GET /nodeinfo
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/.well-known/acme-challenge/:token", get(acme_challenge))
        .route("/nodeinfo", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:blog@host or the actor IRI.
/// The `self` link points at the actor on the host named in the resource.
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<impl IntoResponse, AppError> {
    let iris = lookup_resource(&state.config, &query.resource).ok_or(AppError::NotFound)?;
    let response = generate_webfinger_response(&state.config, &iris);

    Ok((
        [(header::CONTENT_TYPE, "application/jrd+json")],
        Json(response),
    ))
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents on the request host.
async fn nodeinfo_links(State(state): State<AppState>, Host(host): Host) -> Json<serde_json::Value> {
    let base_url = state.config.server.address_for_host(&host);
    Json(serde_json::json!({
        "links": [
            {
                "rel": NODEINFO_SCHEMA,
                "href": format!("{}/nodeinfo", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo
///
/// Returns NodeInfo 2.1 document.
async fn nodeinfo(State(state): State<AppState>) -> Json<serde_json::Value> {
    let default_blog = state.config.blog(&state.config.default_blog);
    Json(serde_json::json!({
        "version": "2.1",
        "software": {
            "name": "goblog",
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": false,
        "usage": {
            "users": {
                "total": state.config.blogs.len()
            }
        },
        "metadata": {
            "nodeName": default_blog.map(|blog| blog.title.as_str()),
            "nodeDescription": default_blog.map(|blog| blog.description.as_str())
        }
    }))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery on the request host.
async fn host_meta(State(state): State<AppState>, Host(host): Host) -> impl IntoResponse {
    let base_url = state.config.server.address_for_host(&host);
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" type="application/jrd+json" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        html_escape::encode_double_quoted_attribute(&base_url)
    );

    ([(header::CONTENT_TYPE, "application/xrd+xml")], xml)
}

/// GET /.well-known/acme-challenge/:token
///
/// Answers pending HTTP-01 challenges.
async fn acme_challenge(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let key_authorization = state
        .challenges
        .http_response(&token)
        .ok_or(AppError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], key_authorization))
}
