use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::types::PhaseSnapshot;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Load sequence already running (phase {})", .current_phase.minute)]
    AlreadyRunning { current_phase: PhaseSnapshot },

    #[error("Invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("Route not found: {method} {path}")]
    NotFound { method: String, path: String },

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an outbound call to a peer service produced no usable answer.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseSnapshot>,
}

impl ErrorResponse {
    pub fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
            current_phase: None,
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::AlreadyRunning { .. } => StatusCode::BAD_REQUEST,
            Error::InvalidBody(rejection) => rejection.status(),
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal(_) | Error::Config(_) | Error::Validation(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            Error::AlreadyRunning { current_phase } => ErrorResponse {
                error: "Load sequence already running".to_string(),
                current_phase: Some(current_phase),
            },
            Error::InvalidBody(rejection) => {
                tracing::warn!(error = %rejection.body_text(), "Rejected request body");
                ErrorResponse::new("Invalid request body")
            }
            Error::NotFound { method, path } => {
                tracing::warn!(%method, %path, "404 - Route not found");
                ErrorResponse::new("Route not found")
            }
            other => {
                tracing::error!(error = %other, "Request failed");
                ErrorResponse::new("Internal server error")
            }
        };

        (status, Json(body)).into_response()
    }
}
