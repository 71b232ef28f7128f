use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::coordinator::PoolCoordinator;
use crate::error::{PoolError, Result};
use crate::metrics::metrics_handler;
use crate::shares::ShareVerdict;
use crate::supervisor::WorkerEvent;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<PoolCoordinator>,
    pub events: mpsc::Sender<WorkerEvent>,
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub ip: IpAddr,
}

/// Routes through which the protocol layer hands over verdicts and bans.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/pools/{coin}/shares", post(submit_share))
        .route("/pools/{coin}/ban", post(ban_ip))
        .route("/pools/{coin}/network", get(network_info))
        .route("/metrics", get(|| async { metrics_handler() }))
        .with_state(state)
}

async fn submit_share(
    State(state): State<ApiState>,
    Path(coin): Path<String>,
    Json(verdict): Json<ShareVerdict>,
) -> Result<StatusCode> {
    state.coordinator.coin(&coin)?.submit(verdict).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn ban_ip(
    State(state): State<ApiState>,
    Path(coin): Path<String>,
    Json(request): Json<BanRequest>,
) -> Result<StatusCode> {
    state.coordinator.coin(&coin)?;
    debug!("{}: ban requested for {}", coin, request.ip);
    state
        .events
        .send(WorkerEvent::BanIp(request.ip))
        .await
        .map_err(|_| PoolError::ChannelClosed)?;
    Ok(StatusCode::ACCEPTED)
}

async fn network_info(
    State(state): State<ApiState>,
    Path(coin): Path<String>,
) -> Result<Json<Value>> {
    let pool = state.coordinator.coin(&coin)?;
    let info = pool.daemon.call("getmininginfo", vec![]).await?.into_result()?;
    Ok(Json(info))
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = match &self {
            PoolError::UnknownCoin(_) => StatusCode::NOT_FOUND,
            PoolError::InvalidShare(_) => StatusCode::BAD_REQUEST,
            PoolError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            PoolError::Daemon(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("API request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
