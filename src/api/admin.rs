//! Operator endpoints
//!
//! Identity moves and follower maintenance. Mounted under
//! `/admin/activitypub` only when `admin.token` is configured; every route
//! requires `Authorization: Bearer <token>`.

use axum::{
    Router,
    extract::{Path, Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::Follower;
use crate::error::AppError;
use crate::federation::{FollowerCheck, IdentityState, MoveReport, RefetchReport};

/// Create admin router
///
/// Routes:
/// - POST /domain-move - Move every blog from an alternate host to the canonical host
/// - POST /profile-update - Send `Update{Person}` for every blog
/// - POST /:blog/move - Move a blog's followers to another account
/// - POST /:blog/followers - Add a follower by handle or IRI
/// - POST /:blog/followers/refetch - Refresh follower inboxes and handles
/// - GET /:blog/followers/check - Check every follower's actor
/// - GET /:blog/state - Identity state of a blog
pub fn admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/domain-move", post(domain_move))
        .route("/profile-update", post(profile_update))
        .route("/:blog/move", post(move_followers))
        .route("/:blog/followers", post(add_follower))
        .route("/:blog/followers/refetch", post(refetch_followers))
        .route("/:blog/followers/check", get(check_followers))
        .route("/:blog/state", get(identity_state))
        .layer(middleware::from_fn_with_state(state, require_admin))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Middleware rejecting requests without the configured bearer token
async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state
        .config
        .admin
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or(AppError::Unauthorized)?;
    let provided = bearer_token(request.headers()).ok_or(AppError::Unauthorized)?;

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// =============================================================================
// Moves
// =============================================================================

/// Domain move request
#[derive(Debug, Deserialize)]
struct DomainMoveRequest {
    old: String,
    new: String,
}

/// POST /admin/activitypub/domain-move
async fn domain_move(
    State(state): State<AppState>,
    Json(req): Json<DomainMoveRequest>,
) -> Result<Json<Vec<MoveReport>>, AppError> {
    tracing::info!(old = %req.old, new = %req.new, "Domain move requested");
    let reports = state.moves.move_domain(&req.old, &req.new).await?;
    Ok(Json(reports))
}

/// Account move request
#[derive(Debug, Deserialize)]
struct MoveRequest {
    target: String,
}

/// POST /admin/activitypub/:blog/move
///
/// The target's `alsoKnownAs` must list the blog, otherwise 422.
async fn move_followers(
    State(state): State<AppState>,
    Path(blog): Path<String>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<MoveReport>, AppError> {
    tracing::info!(%blog, target = %req.target, "Account move requested");
    let report = state.moves.move_followers(&blog, &req.target).await?;
    Ok(Json(report))
}

/// GET /admin/activitypub/:blog/state
async fn identity_state(
    State(state): State<AppState>,
    Path(blog): Path<String>,
) -> Result<Json<IdentityState>, AppError> {
    Ok(Json(state.moves.identity_state(&blog).await?))
}

// =============================================================================
// Followers
// =============================================================================

/// Add follower request
#[derive(Debug, Deserialize)]
struct AddFollowerRequest {
    /// `@user@host` or an actor IRI
    actor: String,
}

/// POST /admin/activitypub/:blog/followers
async fn add_follower(
    State(state): State<AppState>,
    Path(blog): Path<String>,
    Json(req): Json<AddFollowerRequest>,
) -> Result<Json<Follower>, AppError> {
    let follower = state.moves.add_follower_manually(&blog, &req.actor).await?;
    Ok(Json(follower))
}

/// POST /admin/activitypub/:blog/followers/refetch
async fn refetch_followers(
    State(state): State<AppState>,
    Path(blog): Path<String>,
) -> Result<Json<RefetchReport>, AppError> {
    Ok(Json(state.moves.refetch_followers(&blog).await?))
}

/// GET /admin/activitypub/:blog/followers/check
async fn check_followers(
    State(state): State<AppState>,
    Path(blog): Path<String>,
) -> Result<Json<Vec<FollowerCheck>>, AppError> {
    Ok(Json(state.moves.check_followers(&blog).await?))
}

// =============================================================================
// Profile
// =============================================================================

#[derive(Debug, Serialize)]
struct QueuedResponse {
    queued: usize,
}

/// POST /admin/activitypub/profile-update
async fn profile_update(State(state): State<AppState>) -> Result<Json<QueuedResponse>, AppError> {
    let queued = state.outbox.send_profile_updates().await?;
    Ok(Json(QueuedResponse { queued }))
}
