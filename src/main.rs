//! goblog binary entry point

use goblog::{AppState, api, config, shutdown, tls};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background tasks (delivery, post listener, renewal)
/// 6. Start HTTP (and HTTPS) listeners until SIGINT/SIGTERM
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("GOBLOG__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let default_filter = format!(
        "goblog={},tower_http=debug",
        std::env::var("GOBLOG__LOGGING__LEVEL").unwrap_or_else(|_| "info".to_string())
    );

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| default_filter.into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting goblog...");

    // 2. Initialize metrics
    goblog::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        public_address = %config.server.public_address,
        alternates = ?config.server.alternate_domains,
        blogs = config.blogs.len(),
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;
    let token = shutdown::install_signal_handler();

    // 5. Build Axum router
    let app = goblog::build_router(state.clone());

    // 6. Start background tasks
    let tasks = goblog::spawn_background_tasks(&state, token.clone());

    // 7. Start servers
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    let https = match &state.cert_manager {
        Some(manager) => {
            let https_addr = format!("{}:{}", config.server.host, config.tls.https_port);
            let https_listener = tokio::net::TcpListener::bind(&https_addr).await?;
            tracing::info!("HTTPS listening on {}", https_addr);
            Some(tokio::spawn(tls::serve_tls(
                https_listener,
                manager.clone(),
                app.clone(),
                token.clone(),
            )))
        }
        None => None,
    };

    // With TLS, plain HTTP only answers challenges and discovery, and redirects the rest
    let plain_app = if state.cert_manager.is_some() {
        api::wellknown_router()
            .fallback(api::redirect_to_https)
            .with_state(state.clone())
    } else {
        app
    };

    axum::serve(listener, plain_app)
        .with_graceful_shutdown(token.clone().cancelled_owned())
        .await?;

    if let Some(https) = https {
        let _ = https.await;
    }
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}
