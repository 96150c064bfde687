pub mod admin;
pub mod auth;
pub mod cli;
pub mod db;
pub mod gate;
pub mod ledger;
pub mod logger;
pub mod node;
pub mod routes;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use overlay_node::content::FetchError;
use serde_json::json;

/// Our app's top level error type.
#[derive(Debug)]
pub enum AppError {
    /// Input parse failure.
    BadRequest(String),
    /// Missing or invalid token, bad challenge, unknown principal.
    Unauthorized(String),
    /// Private artifact without a qualifying ledger payment.
    PaymentRequired(String),
    /// Artifact exists but has been disabled.
    Forbidden(String),
    /// Not in the local store and the overlay timed out.
    NotFound(String),
    /// Wallet already registered.
    Conflict(String),
    InternalServerError(String),
    /// Ledger oracle unreachable.
    ServiceUnavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::PaymentRequired(msg) => (StatusCode::PAYMENT_REQUIRED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<FetchError> for AppError {
    fn from(value: FetchError) -> Self {
        match value {
            FetchError::Disabled => AppError::Forbidden("Image is disabled".to_string()),
            FetchError::NotFound => AppError::NotFound("Image not found".to_string()),
            FetchError::Store(e) => AppError::InternalServerError(format!("{e:#}")),
        }
    }
}
