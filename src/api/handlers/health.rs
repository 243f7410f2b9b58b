//! Health check endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::RotatorError;

/// Healthy while the reverse proxy is serving and no shutdown is underway
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_shutting_down() {
        return RotatorError::ShuttingDown.into_response();
    }

    let Some(pid) = state.proxy.pid() else {
        return RotatorError::Internal("reverse proxy is not running".to_string()).into_response();
    };

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "torotator",
            "proxy_pid": pid,
        })),
    )
        .into_response()
}
