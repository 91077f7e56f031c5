//! # error
//!
//! Centralised application error type.
//!
//! Every handler returns `Result<_, AppError>`.  Axum's `IntoResponse` impl
//! converts these into structured JSON error bodies so callers always get a
//! machine-readable response even on failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::session::SessionError;
use crate::store::{RegistryError, StoreError};

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The requested resource (e.g. an open trade) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A trade with the same identity is already open.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The price store rejected or failed an operation.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The upstream provider session failed.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyOpen(id) => {
                AppError::Conflict(format!("Trade {} already exists", id.trade_key()))
            }
            RegistryError::Store(e) => AppError::Store(e),
            RegistryError::Codec(e) => AppError::Internal(e.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Store(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
            AppError::Session(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
