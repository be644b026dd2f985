//! Shutdown coordination and supervised background loops.
//!
//! One [`CancellationToken`] is shared by every long-running task. Loops are
//! spawned through [`spawn_supervised`], which restarts a loop that panicked
//! instead of taking the process down with it.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay before a panicked loop is started again
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Installs handlers for SIGTERM and SIGINT.
///
/// Returns a token that is cancelled when either signal is received.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "Failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Received Ctrl+C, shutting down");
        }

        token_clone.cancel();
    });

    token
}

/// Run `make_loop()` until the token is cancelled, restarting it after a panic.
///
/// A loop that returns normally is not restarted.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    shutdown: CancellationToken,
    make_loop: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let run = std::panic::AssertUnwindSafe(make_loop()).catch_unwind();
            match run.await {
                Ok(()) => {
                    tracing::debug!(task = name, "Background task finished");
                    return;
                }
                Err(_) => {
                    tracing::error!(task = name, "Background task panicked; restarting");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
    })
}

/// Sleep for `duration` unless shutdown happens first.
///
/// Returns false when the token was cancelled.
pub async fn sleep_or_cancel(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
