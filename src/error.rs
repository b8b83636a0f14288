use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("validation: {message}")]
    Validation { message: String },

    #[error("auth: {message}")]
    Auth { message: String },

    #[error("auth: not connected to BigQuery")]
    NotConnected,

    #[error("upstream: {message}")]
    Upstream { message: String },

    #[error("timeout: query timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("config: {message}")]
    Config { message: String },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl BridgeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }

    /// The message without its category prefix, as shown to API callers.
    pub fn detail(&self) -> String {
        match self {
            Self::Validation { message }
            | Self::Auth { message }
            | Self::Upstream { message }
            | Self::Config { message } => message.clone(),
            Self::NotConnected => "Not connected to BigQuery".to_string(),
            Self::Timeout { seconds } => format!("query timed out after {}s", seconds),
            Self::Io(e) => e.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Auth { .. } | Self::NotConnected => StatusCode::UNAUTHORIZED,
            Self::Upstream { .. } | Self::Timeout { .. } | Self::Config { .. } | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.detail(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
