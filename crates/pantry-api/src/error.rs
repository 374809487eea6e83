use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Engine(#[from] pantry_core::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    partial_write: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    manual_intervention_required: bool,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    fn status(&self) -> StatusCode {
        use pantry_core::Error as Engine;

        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Engine(error) => match error {
                Engine::Serialization(_) => StatusCode::BAD_REQUEST,
                Engine::InvalidTransition { .. } => StatusCode::CONFLICT,
                Engine::Detection(_) | Engine::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
                Engine::StorageWriteFailure { .. } | Engine::CommitRolledBack { .. } => {
                    StatusCode::BAD_GATEWAY
                }
                Engine::RollbackFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Config(_) => "CONFIGURATION",
            Self::Engine(error) => error.code(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Engine(error) => {
                if error.requires_manual_intervention() {
                    tracing::error!(
                        operation_id = error.operation_id().unwrap_or("unknown"),
                        %error,
                        "Store left in mixed state"
                    );
                }
                ErrorBody {
                    error: self.code(),
                    message: error.to_string(),
                    operation_id: error.operation_id().map(ToString::to_string),
                    partial_write: error.is_partial_write(),
                    manual_intervention_required: error.requires_manual_intervention(),
                }
            }
            Self::BadRequest(_) | Self::NotFound(_) | Self::Config(_) => ErrorBody {
                error: self.code(),
                message: self.to_string(),
                operation_id: None,
                partial_write: false,
                manual_intervention_required: false,
            },
        };
        (status, Json(body)).into_response()
    }
}
