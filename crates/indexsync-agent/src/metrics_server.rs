//! HTTP server for health checks and Prometheus metrics.
//!
//! This module provides a simple HTTP server that exposes:
//! - `/health` - Always returns 200 OK if the process is running
//! - `/ready` - Returns 200 OK while the agent is draining a shard
//! - `/metrics` - Prometheus exposition format metrics
//!
//! ## Usage
//!
//! ```ignore
//! use indexsync_agent::metrics_server::MetricsServer;
//!
//! let agent = Arc::new(agent);
//! let ready = {
//!     let agent = Arc::clone(&agent);
//!     Arc::new(move || agent.status().draining().is_some())
//! };
//!
//! let server = MetricsServer::new("0.0.0.0:8080".parse()?, ready);
//! server.start(shutdown.clone()).await?;
//! ```

use crate::error::Result;
use crate::metrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// HTTP server for health checks and metrics.
pub struct MetricsServer {
    addr: SocketAddr,
    is_ready: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl MetricsServer {
    /// Create a new MetricsServer.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., "0.0.0.0:8080")
    /// * `is_ready` - Whether the agent currently drains a shard
    pub fn new(addr: SocketAddr, is_ready: Arc<dyn Fn() -> bool + Send + Sync>) -> Self {
        Self { addr, is_ready }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        metrics::init();

        let app = router(Arc::new(AppState {
            is_ready: self.is_ready,
        }));

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        tracing::info!(addr = %self.addr, "Metrics server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!(addr = %self.addr, "Metrics server stopped");
        Ok(())
    }
}

struct AppState {
    is_ready: Arc<dyn Fn() -> bool + Send + Sync>,
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> Response {
    if (state.is_ready)() {
        "READY".into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn metrics_handler() -> Response {
    match metrics::gather_text() {
        Ok(text) => text.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
