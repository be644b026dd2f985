//! HTTPS listener
//!
//! Reads the ClientHello before choosing a certificate, so issuance can run
//! inline and TLS-ALPN-01 validation handshakes get the challenge certificate.

use std::sync::Arc;

use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use rustls::ServerConfig;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use super::acme::ACME_TLS_ALPN;
use super::manager::CertManager;
use crate::error::AppError;

/// Serves one already chosen certificate
#[derive(Debug)]
struct ChosenCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ChosenCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Server config for one handshake
pub fn server_config(certificate: Arc<CertifiedKey>, alpn: Vec<Vec<u8>>) -> Result<ServerConfig, AppError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ChosenCert(certificate)));
    config.alpn_protocols = alpn;
    Ok(config)
}

/// Accept TLS connections until shutdown, serving `app` on each
pub async fn serve_tls(
    listener: TcpListener,
    manager: Arc<CertManager>,
    app: Router,
    shutdown: CancellationToken,
) {
    tracing::info!(address = ?listener.local_addr().ok(), "HTTPS listener started");
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(%error, "Failed to accept TLS connection");
                    continue;
                }
            },
        };

        let manager = manager.clone();
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, manager, app).await {
                tracing::debug!(%peer, %error, "TLS connection ended with error");
            }
        });
    }
    tracing::info!("HTTPS listener stopped");
}

async fn handle_connection(
    stream: TcpStream,
    manager: Arc<CertManager>,
    app: Router,
) -> Result<(), AppError> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .map_err(|e| AppError::Tls(format!("Failed to read ClientHello: {}", e)))?;

    let hello = start.client_hello();
    let server_name = hello
        .server_name()
        .map(str::to_string)
        .ok_or_else(|| AppError::Tls("ClientHello without SNI".to_string()))?;
    let validation = hello
        .alpn()
        .is_some_and(|mut protocols| protocols.any(|protocol| protocol == ACME_TLS_ALPN));

    if validation {
        let certificate = manager
            .challenge_certificate(&server_name)
            .ok_or_else(|| AppError::Tls(format!("No pending challenge for {}", server_name)))?;
        let config = server_config(certificate, vec![ACME_TLS_ALPN.to_vec()])?;
        let mut tls = start
            .into_stream(Arc::new(config))
            .await
            .map_err(|e| AppError::Tls(format!("Validation handshake failed: {}", e)))?;
        tracing::debug!(host = %server_name, "Answered TLS-ALPN-01 validation");
        let _ = tls.shutdown().await;
        return Ok(());
    }

    let certificate = manager.get_certificate(&server_name).await?;
    let config = server_config(certificate, vec![b"h2".to_vec(), b"http/1.1".to_vec()])?;
    let tls = start
        .into_stream(Arc::new(config))
        .await
        .map_err(|e| AppError::Tls(format!("Handshake failed: {}", e)))?;

    let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        let app = app.clone();
        async move { app.oneshot(request.map(axum::body::Body::new)).await }
    });

    Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls), service)
        .await
        .map_err(|e| AppError::Tls(format!("HTTPS connection error: {}", e)))
}
