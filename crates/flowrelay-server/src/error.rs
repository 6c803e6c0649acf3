use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use flowrelay_core::FlowId;

pub const FLOW_NOT_FOUND: &str = "Flow not found";

/// Errors surfaced to HTTP callers as `{"error": ...}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Body(#[from] JsonRejection),

    /// `strict` picks 404 over the legacy 200.
    #[error("flow not found: {id}")]
    FlowNotFound { id: FlowId, strict: bool },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Body(rejection) => (rejection.status(), rejection.body_text()),
            ApiError::FlowNotFound { strict, .. } => {
                let status = if *strict {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::OK
                };
                (status, FLOW_NOT_FOUND.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}
