//! ActivityPub endpoints
//!
//! - Actor document on each blog root
//! - Inbox (activity receiving)
//! - Outbox
//! - Followers collection

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Host, OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};

use crate::AppState;
use crate::config::{AppConfig, normalize_host};
use crate::data::moved_to_key;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON, ActorState, BlogIris, InboxRequest, actor_document, actor_html_stub,
    followers_collection, outbox_collection, wants_activity_json,
};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET <blog path> - Actor document (ActivityStreams Accept) or HTML stub
/// - POST /activitypub/inbox/:blog - Inbox
/// - GET /activitypub/outbox/:blog - Outbox
/// - GET /activitypub/followers/:blog - Followers collection
pub fn activitypub_router(config: &AppConfig) -> Router<AppState> {
    let mut router = Router::new()
        .route("/activitypub/inbox/:blog", post(inbox))
        .route("/activitypub/outbox/:blog", get(outbox))
        .route("/activitypub/followers/:blog", get(followers));

    let mut paths: Vec<&str> = config.blogs.values().map(|blog| blog.path.as_str()).collect();
    paths.sort_unstable();
    paths.dedup();
    for path in paths {
        router = router.route(path, get(actor));
    }
    router
}

/// IRIs of `blog` for the host a request arrived on.
///
/// Unknown hosts and the short host get the canonical IRIs.
pub(crate) fn serving_iris(config: &AppConfig, blog: &str, host: &str) -> Option<BlogIris> {
    let host = normalize_host(host);
    if host == config.server.canonical_host() || config.server.is_alternate_host(&host) {
        BlogIris::new(config, blog, &host)
    } else {
        BlogIris::canonical(config, blog)
    }
}

fn blog_for_path<'a>(config: &'a AppConfig, path: &str) -> Option<&'a str> {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    config
        .blogs
        .iter()
        .find(|(_, blog)| blog.path.trim_end_matches('/') == path || blog.path == path)
        .map(|(name, _)| name.as_str())
}

fn activity_json(value: serde_json::Value) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], value.to_string()).into_response()
}

/// GET <blog path>
///
/// Returns the actor document for ActivityStreams clients, a minimal HTML
/// page otherwise. `movedTo` is included once the blog has moved.
async fn actor(
    State(state): State<AppState>,
    Host(host): Host,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let blog = blog_for_path(&state.config, uri.path()).ok_or(AppError::NotFound)?;
    let iris = serving_iris(&state.config, blog, &host).ok_or(AppError::NotFound)?;

    let accept = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !wants_activity_json(accept) {
        return Ok(Html(actor_html_stub(&state.config, &iris)).into_response());
    }

    let moved_to = state.db.get_setting(&moved_to_key(blog)).await?;
    let document = actor_document(
        &state.config,
        &iris,
        &ActorState {
            public_key_pem: state.key.public_key_pem(),
            moved_to: moved_to.as_deref(),
        },
    );

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "actor", "200"])
        .inc();
    Ok(activity_json(document))
}

/// POST /activitypub/inbox/:blog
///
/// Receives incoming ActivityPub activities.
///
/// # Steps
/// 1. Verify HTTP Signature (401 on failure)
/// 2. Parse activity (400 when malformed)
/// 3. Process based on type; outbound answers are only queued
async fn inbox(
    State(state): State<AppState>,
    Path(blog): Path<String>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let result = state
        .inbox
        .handle_inbox(InboxRequest {
            blog: &blog,
            method: method.as_str(),
            path_and_query,
            headers: &headers,
            body: &body,
        })
        .await;

    let status = match &result {
        Ok(()) => StatusCode::ACCEPTED,
        Err(error) => error.status_code(),
    };
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "inbox", status.as_str()])
        .inc();

    if let Err(error) = &result {
        tracing::info!(%blog, %error, "Inbox request rejected");
    }
    result.map(|()| StatusCode::ACCEPTED)
}

/// GET /activitypub/followers/:blog
async fn followers(
    State(state): State<AppState>,
    Host(host): Host,
    Path(blog): Path<String>,
) -> Result<Response, AppError> {
    let iris = serving_iris(&state.config, &blog, &host).ok_or(AppError::NotFound)?;
    let followers: Vec<String> = state
        .db
        .list_followers(&blog)
        .await?
        .into_iter()
        .map(|follower| follower.follower)
        .collect();

    Ok(activity_json(followers_collection(&iris, &followers)))
}

/// GET /activitypub/outbox/:blog
///
/// Always empty; posts are rendered by the post store.
async fn outbox(
    State(state): State<AppState>,
    Host(host): Host,
    Path(blog): Path<String>,
) -> Result<Response, AppError> {
    let iris = serving_iris(&state.config, &blog, &host).ok_or(AppError::NotFound)?;
    Ok(activity_json(outbox_collection(&iris)))
}
