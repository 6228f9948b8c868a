//! Orchestrator API handlers.

use axum::{extract::State, http::StatusCode, Json};
use reelflow_core::{OrchestratorStatus, RescanReport};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

/// Orchestrator status response
#[derive(Debug, Serialize)]
pub struct OrchestratorStatusResponse {
    /// Whether an orchestrator was built at startup
    pub available: bool,
    #[serde(flatten)]
    pub status: Option<OrchestratorStatus>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct OrchestratorErrorResponse {
    pub error: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<OrchestratorErrorResponse>)>;

fn unavailable() -> (StatusCode, Json<OrchestratorErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(OrchestratorErrorResponse {
            error: "Orchestrator not available".to_string(),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<OrchestratorErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(OrchestratorErrorResponse {
            error: e.to_string(),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// Get orchestrator status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<OrchestratorStatusResponse>> {
    match state.orchestrator() {
        Some(orch) => {
            let status = orch.status().await.map_err(internal)?;
            Ok(Json(OrchestratorStatusResponse {
                available: true,
                status: Some(status),
            }))
        }
        None => Ok(Json(OrchestratorStatusResponse {
            available: false,
            status: None,
        })),
    }
}

/// Run the re-admission scan now
pub async fn rescan(State(state): State<Arc<AppState>>) -> ApiResult<Json<RescanReport>> {
    let orch = state.orchestrator().ok_or_else(unavailable)?;
    let report = orch.rescan_now().await.map_err(internal)?;
    Ok(Json(report))
}
