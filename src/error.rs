use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the rotator
#[derive(Error, Debug)]
pub enum RotatorError {
    // Process lifecycle errors
    #[error("Failed to launch {service} on port {port}: {reason}")]
    Launch {
        service: String,
        port: u16,
        reason: String,
    },

    #[error("Failed to read output of {service}: {source}")]
    Stream {
        service: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to terminate {service} (pid {pid}): {reason}")]
    Termination {
        service: String,
        pid: u32,
        reason: String,
    },

    // Reverse proxy errors
    #[error("Failed to render proxy configuration: {0}")]
    Render(String),

    #[error("Failed to hand off to a new proxy instance: {0}")]
    Handoff(String),

    // Port allocation
    #[error("All ports in {floor}-{ceiling} are leased")]
    PortsExhausted { floor: u16, ceiling: u16 },

    // Startup errors
    #[error("Missing required program: {0}")]
    MissingDependency(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Application is shutting down")]
    ShuttingDown,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for rotator operations
pub type Result<T> = std::result::Result<T, RotatorError>;

impl RotatorError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RotatorError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            RotatorError::PortsExhausted { .. } | RotatorError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            RotatorError::Launch { .. } | RotatorError::Handoff(_) => StatusCode::BAD_GATEWAY,

            RotatorError::Stream { .. }
            | RotatorError::Termination { .. }
            | RotatorError::Render(_)
            | RotatorError::MissingDependency(_)
            | RotatorError::Io(_)
            | RotatorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RotatorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
