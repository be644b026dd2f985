//! Prometheus scrape endpoint
//!
//! Gauges backed by the store (queue depth, follower rows) are refreshed on
//! every scrape so they stay right after restarts and admin edits.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::federation::DELIVERY_TOPIC;
use crate::metrics::{FOLLOWERS_TOTAL, QUEUE_DEPTH, REGISTRY};

async fn refresh_gauges(state: &AppState) {
    match state.db.queue_len(DELIVERY_TOPIC).await {
        Ok(depth) => QUEUE_DEPTH.with_label_values(&[DELIVERY_TOPIC]).set(depth),
        Err(error) => tracing::debug!(%error, "Queue depth unavailable"),
    }
    if let Ok(total) = state.db.count_all_followers().await {
        FOLLOWERS_TOTAL.set(total);
    }
}

async fn scrape(State(state): State<AppState>) -> Response {
    refresh_gauges(&state).await;

    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&REGISTRY.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, encoder.format_type())], body).into_response(),
        Err(error) => {
            tracing::error!(%error, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `/metrics` in the Prometheus text format
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(scrape))
}
