//! Metrics and health probe server
//!
//! Serves `/metrics` in Prometheus text format, `/healthz` (always OK) and
//! `/readyz` (OK once the manager has started) on the metrics address. The
//! server runs as an ungated runnable so standby replicas stay observable.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::manager::ManagerStatus;
use crate::metrics;
use crate::runnable::Runnable;
use crate::{Error, Result};

/// Runnable name of the probe server
pub const PROBE_SERVER_NAME: &str = "probe-server";

/// Parse a metrics bind address flag
///
/// `"0"` disables the server. A bare `:port` binds every interface.
pub fn parse_bind_address(value: &str) -> Result<Option<SocketAddr>> {
    let value = value.trim();
    if value == "0" {
        return Ok(None);
    }

    let candidate = match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => value.to_string(),
    };

    candidate
        .parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| Error::config(format!("invalid metrics bind address {value:?}: {e}")))
}

async fn metrics_handler() -> impl IntoResponse {
    match tokio::task::spawn_blocking(metrics::encode).await {
        Ok(Ok(body)) => (StatusCode::OK, body),
        Ok(Err(e)) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
        }
        Err(e) => {
            error!(error = %e, "Metrics gathering task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to gather metrics".to_string(),
            )
        }
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(status): State<ManagerStatus>) -> impl IntoResponse {
    if status.is_started() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "manager not started")
    }
}

/// Build the probe router
pub fn router(status: ManagerStatus) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(status)
}

/// HTTP server for metrics and probes
pub struct ProbeServer {
    addr: SocketAddr,
    status: ManagerStatus,
}

impl ProbeServer {
    /// Create a server bound to `addr` reporting on `status`
    pub fn new(addr: SocketAddr, status: ManagerStatus) -> Self {
        Self { addr, status }
    }
}

#[async_trait]
impl Runnable for ProbeServer {
    fn name(&self) -> &str {
        PROBE_SERVER_NAME
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            Error::runnable(PROBE_SERVER_NAME, format!("failed to bind {}: {e}", self.addr))
        })?;
        let local = listener.local_addr().unwrap_or(self.addr);

        info!(address = %local, "Serving metrics and health probes");

        axum::serve(listener, router(self.status.clone()))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::runnable(PROBE_SERVER_NAME, format!("server error: {e}")))?;

        info!("Probe server stopped");
        Ok(())
    }

    fn needs_leader_election(&self) -> bool {
        false
    }
}
