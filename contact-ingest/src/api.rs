use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that reject a whole request before any event reaches the pipeline.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),

    #[error("request submitted without a bearer token")]
    NoTokenError,
    #[error("bearer token is not valid: {0}")]
    TokenValidationError(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match self {
            IngestError::RequestParsingError(_) => StatusCode::BAD_REQUEST,
            IngestError::NoTokenError | IngestError::TokenValidationError(_) => {
                StatusCode::UNAUTHORIZED
            }
        };

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Reasons a single event of a batch is not accepted. Rejecting one event never
/// affects its siblings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("Unauthorized venue {venue} specified; token only has access to {allowed}")]
    Unauthorized { venue: String, allowed: String },
    #[error("Accuracy of {accuracy} exceeds threshold of {threshold}")]
    AccuracyExceeded { accuracy: f64, threshold: f64 },
    #[error("userConsent was not set to true so the event was ignored")]
    MissingConsent,
    /// Another event of the same batch already claimed this device's time bucket.
    #[error("There is already a position for this device at this time")]
    DuplicateBucket,
    /// The store already holds an event for this device and time bucket.
    #[error("There is already a position for this device at this time")]
    AlreadyExists,
    #[error("An unexpected server error has occured")]
    Internal,
    #[error("The service is shutting down, please retry")]
    ShuttingDown,
}

impl PositionError {
    pub fn status(&self) -> StatusCode {
        match self {
            PositionError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            PositionError::AccuracyExceeded { .. } | PositionError::MissingConsent => {
                StatusCode::BAD_REQUEST
            }
            PositionError::DuplicateBucket | PositionError::AlreadyExists => StatusCode::CONFLICT,
            PositionError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            PositionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Label used when counting rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            PositionError::Unauthorized { .. } => "unauthorized",
            PositionError::AccuracyExceeded { .. } => "accuracy_exceeded",
            PositionError::MissingConsent => "missing_consent",
            PositionError::DuplicateBucket => "duplicate_bucket",
            PositionError::AlreadyExists => "already_exists",
            PositionError::Internal => "internal",
            PositionError::ShuttingDown => "shutting_down",
        }
    }
}

/// Outcome of one submitted event. The response body holds one of these per input event,
/// in request order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PositionResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PositionResponse {
    pub fn accepted() -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            message: None,
        }
    }
}

impl From<PositionError> for PositionResponse {
    fn from(error: PositionError) -> Self {
        Self {
            status: error.status().as_u16(),
            message: Some(error.to_string()),
        }
    }
}

impl From<Result<(), PositionError>> for PositionResponse {
    fn from(result: Result<(), PositionError>) -> Self {
        match result {
            Ok(()) => PositionResponse::accepted(),
            Err(error) => error.into(),
        }
    }
}
