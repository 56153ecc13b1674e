use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use macro_engine::MacroError;
use serde_json::json;
use thiserror::Error;

/// Result type for macrosrv
pub type Result<T> = std::result::Result<T, MacrosrvError>;

/// Errors that can occur in macrosrv
#[derive(Error, Debug)]
pub enum MacrosrvError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] MacroError),
}

impl IntoResponse for MacrosrvError {
    fn into_response(self) -> Response {
        let status = match &self {
            MacrosrvError::BadRequest(_) => StatusCode::BAD_REQUEST,
            MacrosrvError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MacrosrvError::Engine(err) => match err {
                MacroError::NotFound(_) | MacroError::NotSuspended(_) => StatusCode::NOT_FOUND,
                MacroError::Validation(_) => StatusCode::BAD_REQUEST,
                MacroError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                MacroError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
