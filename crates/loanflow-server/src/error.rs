//! HTTP error mapping.
//!
//! Every failure leaves the server as `{ "success": false, "message": ... }`.
//! Internal errors also attach an [`ErrorDetail`] extension holding the error
//! source chain; the request pipeline turns it into a `stack` array outside
//! production.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use loanflow_audit::AuditError;
use loanflow_runtime::{ChatError, StoreError};
use serde_json::json;
use thiserror::Error;

pub const MSG_UNAUTHORIZED: &str = "Authentication required";
pub const MSG_FORBIDDEN: &str = "Admin access required";
pub const MSG_LOAN_NOT_FOUND: &str = "Loan not found";
pub const MSG_ROUTE_NOT_FOUND: &str = "Route not found";
pub const MSG_RATE_LIMITED: &str = "Too many requests, please try again later.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Admin access required")]
    Forbidden,

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("Too many requests, please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("{message}")]
    Internal { message: String, chain: Vec<String> },
}

impl ApiError {
    /// Capture `err` and its sources as an internal error.
    pub fn internal(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        ApiError::Internal {
            message: err.to_string(),
            chain,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::NotFound(_) => ApiError::NotFound(MSG_LOAN_NOT_FOUND),
            ChatError::Store(store) => ApiError::from(store),
            other => ApiError::internal(&other),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(MSG_LOAN_NOT_FOUND),
            other => ApiError::internal(&other),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        ApiError::internal(&err)
    }
}

/// Source chain of an internal error, carried on the response.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    pub message: String,
    pub chain: Vec<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let body = Json(json!({ "success": false, "message": message }));

        match self {
            ApiError::RateLimited { retry_after_secs } => {
                let mut response = (status, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            ApiError::Internal { message, chain } => {
                tracing::error!(error = %message, causes = ?chain, "Request failed");
                let mut response = (status, body).into_response();
                response
                    .extensions_mut()
                    .insert(ErrorDetail { message, chain });
                response
            }
            _ => (status, body).into_response(),
        }
    }
}

/// Rebuild an internal-error body with its `stack`.
pub fn with_stack(status: StatusCode, detail: &ErrorDetail) -> Response {
    let mut stack = vec![detail.message.clone()];
    stack.extend(detail.chain.iter().cloned());
    (
        status,
        Json(json!({ "success": false, "message": detail.message, "stack": stack })),
    )
        .into_response()
}
