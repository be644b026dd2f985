//! goblog - federated publishing core of a self-hosted blog
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actor, inbox, collections                    │
//! │  - WebFinger, host-meta, NodeInfo, ACME HTTP-01             │
//! │  - Alternate-domain routing, operator endpoints             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Federation Layer                         │
//! │  - Inbox processing, outbox fanout, domain moves            │
//! │  - HTTP signatures, remote actors                           │
//! │  - Delivery worker on the durable queue                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): settings, followers, queue, cert cache    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers and routing middleware
//! - `federation`: ActivityPub federation handling
//! - `tls`: ACME certificates and the HTTPS listener
//! - `data`: Database layer
//! - `queue`: Durable queue worker
//! - `posts`, `sinks`: Collaborator interfaces
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod posts;
pub mod queue;
pub mod shutdown;
pub mod sinks;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use federation::{
    ActivityProcessor, BlogIris, DELIVERY_TOPIC, DeliveryQueue, DeliveryWorker, InstanceKey,
    MoveEngine, Outbox, RemoteActors,
};
use posts::{BroadcastPostSource, PostSource};
use sinks::{InteractionSink, NotificationSink, TracingInteractionSink, TracingNotificationSink};

/// Application state shared across all handlers
///
/// Cloned for each request; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: reqwest::Client,

    /// Instance signing key
    pub key: Arc<InstanceKey>,

    /// Remote actor fetcher and cache
    pub remote: Arc<RemoteActors>,

    pub queue: DeliveryQueue,
    pub outbox: Arc<Outbox>,
    pub inbox: Arc<ActivityProcessor>,
    pub moves: Arc<MoveEngine>,

    /// In-process post lifecycle events
    pub posts: Arc<BroadcastPostSource>,

    /// Pending ACME challenges (served over TLS-ALPN and HTTP)
    pub challenges: Arc<tls::ChallengeStore>,

    /// Present when automatic TLS is enabled
    pub cert_manager: Option<Arc<tls::CertManager>>,
}

impl AppState {
    /// Initialize application state with log-only sinks
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        Self::with_sinks(
            config,
            Arc::new(TracingNotificationSink),
            Arc::new(TracingInteractionSink),
        )
        .await
    }

    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Load or generate the instance key
    /// 3. Build the federation components
    /// 4. Build the certificate manager when TLS is enabled
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn with_sinks(
        config: config::AppConfig,
        notifications: Arc<dyn NotificationSink>,
        interactions: Arc<dyn InteractionSink>,
    ) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");
        let config = Arc::new(config);

        // 1. Database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        if let Ok(total) = db.count_all_followers().await {
            metrics::FOLLOWERS_TOTAL.set(total);
        }

        // 2. Instance key
        let key = Arc::new(InstanceKey::load_or_generate(&db, config.activitypub.key_bits).await?);

        // 3. Federation
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("goblog/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let fetch_key_id = BlogIris::canonical(&config, &config.default_blog)
            .map(|iris| iris.key_id())
            .ok_or_else(|| error::AppError::Config("default_blog is not configured".to_string()))?;
        let remote = Arc::new(RemoteActors::new(
            http_client.clone(),
            key.clone(),
            fetch_key_id,
            Duration::from_secs(config.activitypub.actor_cache_ttl_secs),
            config.activitypub.allow_private_addresses,
        ));

        let queue = DeliveryQueue::new(db.clone());
        let outbox = Arc::new(Outbox::new(
            config.clone(),
            db.clone(),
            queue.clone(),
            remote.clone(),
            key.clone(),
        ));
        let inbox = Arc::new(ActivityProcessor::new(
            config.clone(),
            db.clone(),
            remote.clone(),
            queue.clone(),
            notifications,
            interactions,
        ));
        let moves = Arc::new(MoveEngine::new(
            config.clone(),
            db.clone(),
            remote.clone(),
            queue.clone(),
        ));

        // 4. TLS
        let challenges = Arc::new(tls::ChallengeStore::new());
        let cert_manager = if config.tls.enabled {
            let issuer = Arc::new(tls::AcmeIssuer::new(db.clone(), &config.tls, challenges.clone()));
            let allowlist = tls::host_allowlist(&config);
            tracing::info!(hosts = ?allowlist, directory = %config.tls.directory_url, "Automatic TLS enabled");
            Some(Arc::new(tls::CertManager::new(
                db.clone(),
                issuer,
                challenges.clone(),
                allowlist,
                chrono::Duration::days(config.tls.renew_before_days),
                Duration::from_secs(config.tls.issuance_timeout_secs),
            )))
        } else {
            None
        };

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config,
            db,
            http_client,
            key,
            remote,
            queue,
            outbox,
            inbox,
            moves,
            posts: Arc::new(BroadcastPostSource::default()),
            challenges,
            cert_manager,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let mut router = Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router());
    if state.config.activitypub.enabled {
        router = router.merge(api::activitypub_router(&state.config));
    }
    if state.config.admin.token.is_some() {
        router = router.nest("/admin/activitypub", api::admin_router(state.clone()));
    }

    router
        .merge(api::metrics_router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api::alt_domain_redirect,
        ))
        .layer(RequestBodyLimitLayer::new(api::MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

/// Start every background loop; the handles finish after `shutdown`
pub fn spawn_background_tasks(state: &AppState, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let delivery = Arc::new(DeliveryWorker::new(
        state.db.clone(),
        state.http_client.clone(),
        state.key.clone(),
        &state.config.delivery,
    ));
    let timing = queue::WorkerTiming {
        poll_interval: Duration::from_millis(state.config.delivery.poll_interval_ms),
        pacing: Duration::from_millis(state.config.delivery.pacing_ms),
    };
    {
        let db = state.db.clone();
        let token = shutdown.clone();
        handles.push(shutdown::spawn_supervised("delivery", shutdown.clone(), move || {
            queue::run_worker(
                db.clone(),
                DELIVERY_TOPIC.to_string(),
                delivery.clone(),
                timing,
                token.clone(),
            )
        }));
    }

    {
        let outbox = state.outbox.clone();
        let source: Arc<dyn PostSource> = state.posts.clone();
        let token = shutdown.clone();
        handles.push(shutdown::spawn_supervised("post-listener", shutdown.clone(), move || {
            federation::run_post_listener(outbox.clone(), source.clone(), token.clone())
        }));
    }

    if state.config.activitypub.send_profile_updates {
        let outbox = state.outbox.clone();
        let delay = Duration::from_secs(state.config.activitypub.profile_update_delay_secs);
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if !shutdown::sleep_or_cancel(delay, &token).await {
                return;
            }
            if let Err(error) = outbox.send_profile_updates().await {
                tracing::error!(%error, "Startup profile update failed");
            }
        }));
    }

    {
        let remote = state.remote.clone();
        let db = state.db.clone();
        let interval = Duration::from_secs(state.config.activitypub.actor_cache_ttl_secs.max(60));
        let retention =
            chrono::Duration::days(state.config.activitypub.notification_retention_days.max(1));
        let token = shutdown.clone();
        handles.push(shutdown::spawn_supervised("actor-cache-prune", shutdown.clone(), move || {
            let remote = remote.clone();
            let db = db.clone();
            let token = token.clone();
            async move {
                while shutdown::sleep_or_cancel(interval, &token).await {
                    remote.prune_expired().await;
                    match db.prune_notifications(chrono::Utc::now() - retention).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "Pruned notification dedupe keys"),
                        Err(error) => tracing::warn!(%error, "Notification prune failed"),
                    }
                }
            }
        }));
    }

    if let Some(manager) = &state.cert_manager {
        let manager = manager.clone();
        let interval = Duration::from_secs(state.config.tls.renew_check_interval_secs.max(60));
        let token = shutdown.clone();
        handles.push(shutdown::spawn_supervised("cert-renewal", shutdown.clone(), move || {
            manager.clone().run_renewal_loop(interval, token.clone())
        }));
    }

    tracing::info!(tasks = handles.len(), "Background tasks spawned");
    handles
}
