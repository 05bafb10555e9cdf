//! Inventory API Server
//!
//! Serves the inventory REST router over plain HTTP or, when a certificate
//! pair is configured, over TLS.

use crate::error::{Error, Result};
use crate::inventory::Container;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::rest::{RestRouter, CONSISTENCY_TIMEOUT};

/// Time allowed for in-flight requests once shutdown is signalled
const GRACE_PERIOD: Duration = Duration::from_secs(5);

// =============================================================================
// Server Configuration
// =============================================================================

/// Certificate and key files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Configuration for the inventory API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub addr: SocketAddr,
    /// Serve TLS when set
    pub tls: Option<TlsPaths>,
    /// Wait for collector consistency before answering
    pub consistency_timeout: Duration,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            tls: None,
            consistency_timeout: CONSISTENCY_TIMEOUT,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// Inventory REST server
pub struct ApiServer {
    config: ApiServerConfig,
    container: Arc<Container>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, container: Arc<Container>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            container,
            shutdown_tx,
        }
    }

    /// Run until [`ApiServer::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let app = RestRouter::new(self.container.clone())
            .with_consistency_timeout(self.config.consistency_timeout)
            .build()
            .layer(TraceLayer::new_for_http());

        info!(addr = %self.config.addr, tls = self.config.tls.is_some(), "Inventory API listening");
        let result = serve(self.config.addr, app, self.config.tls.as_ref(), self.shutdown_tx.subscribe()).await;
        if let Err(e) = &result {
            error!(error = %e, "Inventory API server failed");
        }
        result
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Serve `app` on `addr` until a shutdown signal arrives.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    tls: Option<&TlsPaths>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let Some(tls) = tls else {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        return axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!(%addr, "Server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("Server error: {}", e)));
    };

    let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
        .await
        .map_err(|e| Error::Configuration(format!("TLS config error: {}", e)))?;

    let handle = axum_server::Handle::new();
    let signal = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        info!(%addr, "Server shutting down");
        signal.graceful_shutdown(Some(GRACE_PERIOD));
    });

    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::container::tests::FakeBuilder;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.addr.port(), 8090);
        assert!(config.tls.is_none());
        assert_eq!(config.consistency_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let config = ApiServerConfig {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let container = Arc::new(Container::new(Arc::new(FakeBuilder::default())));
        let server = Arc::new(ApiServer::new(config, container));

        let running = server.clone();
        let task = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
