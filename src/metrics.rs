//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("goblog_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("goblog_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_QUEUED: IntCounterVec = IntCounterVec::new(
        Opts::new("goblog_activitypub_activities_queued_total", "Total number of outbound ActivityPub deliveries queued"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("goblog_activitypub_deliveries_total", "Outcome of outbound delivery attempts"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "goblog_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["direction"]
    ).expect("metric can be created");
    pub static ref FOLLOWERS_TOTAL: IntGauge = IntGauge::new(
        "goblog_followers_total",
        "Total number of follower rows across all blogs"
    ).expect("metric can be created");

    // Queue Metrics
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("goblog_queue_depth", "Number of items waiting in a queue topic"),
        &["topic"]
    ).expect("metric can be created");

    // TLS Metrics
    pub static ref CERTIFICATES_ISSUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("goblog_certificates_issued_total", "ACME certificate orders by outcome"),
        &["outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("goblog_errors_total", "Total number of errors returned to HTTP clients"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HTTP_REQUESTS_TOTAL.clone()),
            Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()),
            Box::new(ACTIVITYPUB_ACTIVITIES_QUEUED.clone()),
            Box::new(ACTIVITYPUB_DELIVERIES_TOTAL.clone()),
            Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
            Box::new(FOLLOWERS_TOTAL.clone()),
            Box::new(QUEUE_DEPTH.clone()),
            Box::new(CERTIFICATES_ISSUED_TOTAL.clone()),
            Box::new(ERRORS_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(error) = REGISTRY.register(collector) {
                tracing::warn!(%error, "Failed to register metric");
            }
        }
    });
}
