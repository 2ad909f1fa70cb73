use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{StartError, StopError};
use crate::orchestrator::{ScanOrchestrator, StatusReport, StopReason};
use crate::types::ScanRequest;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ScanOrchestrator>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanAccepted {
    pub scan_id: String,
    pub state: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub scan_id: Option<String>,
    #[serde(default)]
    pub reason: Option<StopReasonParam>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReasonParam {
    Requested,
    Deadline,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, key, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, "bad_request", m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, "conflict", m),
            ApiError::InvalidConfig(m) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_config", m),
        };
        (status, Json(ApiErrorBody { error: key.into(), message })).into_response()
    }
}

impl From<StartError> for ApiError {
    fn from(e: StartError) -> Self {
        match e {
            StartError::Conflict { .. } => ApiError::Conflict(e.to_string()),
            StartError::Invalid(m) => ApiError::InvalidConfig(m),
        }
    }
}

impl From<StopError> for ApiError {
    fn from(e: StopError) -> Self {
        match e {
            StopError::NotRunning => ApiError::Conflict(e.to_string()),
            StopError::UnknownScan { .. } => ApiError::NotFound(e.to_string()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scans", post(post_scan))
        .route("/scans/stop", post(post_stop))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
}

/// Serve the control surface until Ctrl+C; an active scan is stopped on the way out.
pub async fn spawn_server(bind: &str, orchestrator: Arc<ScanOrchestrator>) -> Result<()> {
    let app = router(AppState { orchestrator: orchestrator.clone() });
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %listener.local_addr()?, "control surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            if let Ok(scan_id) = orchestrator.stop(None, StopReason::Requested) {
                info!(scan_id = %scan_id, "stopping active scan for shutdown");
            }
        })
        .await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> Json<StatusReport> {
    Json(app.orchestrator.status())
}

async fn post_scan(
    State(app): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<(StatusCode, Json<ScanAccepted>), ApiError> {
    // The handle is dropped: the scan runs detached and reports through callbacks.
    let handle = app.orchestrator.start(req)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScanAccepted { scan_id: handle.scan_id().to_string(), state: "running".into() }),
    ))
}

async fn post_stop(State(app): State<AppState>, body: Bytes) -> Result<(StatusCode, Json<ScanAccepted>), ApiError> {
    let req: StopRequest = if body.is_empty() {
        StopRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let reason = match req.reason {
        Some(StopReasonParam::Deadline) => StopReason::Deadline,
        _ => StopReason::Requested,
    };
    let scan_id = app.orchestrator.stop(req.scan_id.as_deref(), reason)?;
    Ok((StatusCode::ACCEPTED, Json(ScanAccepted { scan_id, state: "stopping".into() })))
}
