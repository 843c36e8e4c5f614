//! Route handlers.

pub mod admin;
pub mod chat;
pub mod health;
pub mod loans;

use axum::Json;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::error::MSG_ROUTE_NOT_FOUND;

/// Fallback for unmatched routes.
pub async fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": MSG_ROUTE_NOT_FOUND })),
    )
}
