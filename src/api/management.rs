// Management API handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::config::{self, StreamingMode};
use crate::error::RotationError;

/// Rotation state, account list and channel health
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status())
}

#[derive(Debug, Default, Deserialize)]
pub struct SwitchAccountRequest {
    #[serde(default)]
    pub index: Option<usize>,
}

/// Rotate to a given account, or to the next one when no index is given
pub async fn switch_account(
    State(state): State<AppState>,
    body: Option<Json<SwitchAccountRequest>>,
) -> Response {
    let index = body.and_then(|Json(request)| request.index);
    tracing::info!("Manual account switch requested (target: {:?})", index);

    match state.orchestrator.switch_account(index).await {
        Ok(outcome) => Json(json!({
            "status": "ok",
            "previous": outcome.previous,
            "current": outcome.current,
        }))
        .into_response(),
        Err(e) => {
            let status = match e {
                RotationError::Busy => StatusCode::CONFLICT,
                RotationError::OnlyOneAccount | RotationError::InvalidAccount(_) => StatusCode::BAD_REQUEST,
                RotationError::FallbackSucceeded { .. } | RotationError::FallbackFailed { .. } => {
                    StatusCode::BAD_GATEWAY
                }
            };
            (
                status,
                Json(json!({
                    "status": "error",
                    "error": e.to_string(),
                    "current": state.orchestrator.rotator().current_index(),
                })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamingModeRequest {
    pub mode: String,
}

pub async fn set_streaming_mode(
    State(state): State<AppState>,
    Json(request): Json<StreamingModeRequest>,
) -> Response {
    let mode: StreamingMode = match request.mode.parse() {
        Ok(mode) => mode,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response(),
    };

    let shared = state.orchestrator.shared_config();
    let mut updated = shared.read().clone();
    updated.streaming_mode = mode;
    if let Err(e) = config::update_config(shared, updated) {
        // The in-memory switch already happened; only persistence failed.
        tracing::warn!("Failed to persist streaming mode: {}", e);
    }
    tracing::info!("Streaming mode set to {}", mode.as_str());

    Json(json!({ "status": "ok", "mode": mode.as_str() })).into_response()
}
