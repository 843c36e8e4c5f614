//! # loanflow-server
//!
//! HTTP surface for Loanflow.
//!
//! | Route | Access |
//! |-------|--------|
//! | `GET /health` | public |
//! | `POST /api/chat/message` | public |
//! | `GET /api/chat/loan/{loan_id}` | authenticated |
//! | `GET /api/loans/user` | authenticated |
//! | `PATCH /api/admin/loans/{loan_id}` | admin |
//! | `GET /api/admin/audit` | admin |
//!
//! Every request passes through [`middleware::request_pipeline`], which
//! resolves the caller, enforces the rate limit, and records timing and
//! audit entries.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod state;
pub mod telemetry;

use axum::routing::{get, patch, post};
use axum::{Router, middleware as axum_middleware};
use tower_http::trace::TraceLayer;

pub use error::ApiError;
pub use state::{AppState, StartupError};

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let chat = Router::new()
        .route("/message", post(handlers::chat::send_message))
        .route("/loan/{loan_id}", get(handlers::chat::get_loan));

    let admin = Router::new()
        .route("/loans/{loan_id}", patch(handlers::admin::override_loan))
        .route("/audit", get(handlers::admin::list_audit));

    Router::new()
        .route("/health", get(handlers::health::health))
        .nest("/api/chat", chat)
        .nest("/api/admin", admin)
        .route("/api/loans/user", get(handlers::loans::list_user_loans))
        .fallback(handlers::not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::request_pipeline,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
