//! Status endpoint, served on its own port so the forwarder's paths stay a
//! pure passthrough.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ShimError;
use crate::supervisor::{StatusHandle, UpstreamStatus};

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub upstream: UpstreamStatus,
    pub uptime_secs: u64,
}

#[derive(Clone)]
pub struct StatusState {
    started: Instant,
    upstream: StatusHandle,
}

impl StatusState {
    pub fn new(upstream: StatusHandle) -> Self {
        Self {
            started: Instant::now(),
            upstream,
        }
    }
}

async fn health_handler(State(state): State<StatusState>) -> (StatusCode, Json<HealthReport>) {
    let upstream = state.upstream.snapshot();
    let (code, status) = if upstream.running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "upstream_down")
    };

    (
        code,
        Json(HealthReport {
            status: status.to_string(),
            upstream,
            uptime_secs: state.started.elapsed().as_secs(),
        }),
    )
}

async fn live_handler() -> StatusCode {
    StatusCode::OK
}

pub fn create_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Serve the status endpoint on `0.0.0.0:{port}` until the task is aborted.
pub async fn serve_status(state: StatusState, port: u16) -> Result<(), ShimError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ShimError::Bind { addr, source })?;
    info!(%addr, "Status endpoint listening");
    axum::serve(listener, create_status_router(state))
        .await
        .map_err(ShimError::Serve)
}
