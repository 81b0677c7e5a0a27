//! HTTP server for the Bulwark service.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::router;
use crate::error::{BulwarkError, Result};
use crate::ratelimit::RateLimitEngine;

/// HTTP server exposing the decision and admin endpoints.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The engine behind every endpoint
    engine: Arc<RateLimitEngine>,
}

impl HttpServer {
    /// Create a new server over `engine`.
    pub fn new(addr: SocketAddr, engine: Arc<RateLimitEngine>) -> Self {
        Self { addr, engine }
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests finish.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            BulwarkError::Server(format!("failed to bind {}: {}", self.addr, e))
        })?;

        info!(addr = %self.addr, "Starting HTTP server");

        let app = router(self.engine);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            BulwarkError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:8081".parse().unwrap();
        let engine = Arc::new(RateLimitEngine::in_memory());
        let _server = HttpServer::new(addr, engine);
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, Arc::new(RateLimitEngine::in_memory()));
        tokio_test::assert_ok!(server.serve_with_shutdown(async {}).await);
    }

    #[tokio::test]
    async fn test_bind_failure_is_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = listener.local_addr().unwrap();

        let server = HttpServer::new(taken, Arc::new(RateLimitEngine::in_memory()));
        let result = server.serve_with_shutdown(async {}).await;
        assert!(matches!(result, Err(BulwarkError::Server(_))));
    }
}
