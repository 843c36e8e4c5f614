//! Conversation routes.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use loanflow_core::{GUEST_OWNER, LoanApplication};
use loanflow_runtime::{ChatOutcome, LoanStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, MSG_LOAN_NOT_FOUND};
use crate::middleware::Principal;
use crate::state::AppState;

/// Set on replies that came from the fallback script.
pub const HEADER_DEGRADED: &str = "x-loanflow-degraded";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub message: String,
    #[serde(default)]
    pub loan_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: ChatOutcome,
}

#[derive(Debug, Serialize)]
pub struct LoanResponse {
    pub success: bool,
    pub loan: LoanApplication,
}

/// Parse a client-supplied loan id. Blank means "start a new application".
///
/// An id that is not a UUID cannot name a stored loan, so it is reported as
/// not found.
pub(crate) fn parse_loan_id(raw: Option<&str>) -> Result<Option<Uuid>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|_| ApiError::NotFound(MSG_LOAN_NOT_FOUND)),
    }
}

/// `POST /api/chat/message`
pub async fn send_message(
    State(state): State<AppState>,
    principal: Option<Principal>,
    body: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let loan_id = parse_loan_id(body.loan_id.as_deref())?;

    let owner_id = principal
        .map(|p| p.user_id)
        .or(body.user_id.filter(|u| !u.trim().is_empty()))
        .unwrap_or_else(|| GUEST_OWNER.to_string());

    let outcome = state
        .orchestrator()
        .handle_message(&body.message, loan_id, &owner_id)
        .await?;

    let degraded = outcome.degraded;
    let mut response = Json(MessageResponse {
        success: true,
        outcome,
    })
    .into_response();
    if degraded {
        response
            .headers_mut()
            .insert(HEADER_DEGRADED, HeaderValue::from_static("true"));
    }
    Ok(response)
}

/// `GET /api/chat/loan/{loan_id}`
pub async fn get_loan(
    State(state): State<AppState>,
    _principal: Principal,
    Path(loan_id): Path<String>,
) -> Result<Json<LoanResponse>, ApiError> {
    let id = parse_loan_id(Some(&loan_id))?.ok_or(ApiError::NotFound(MSG_LOAN_NOT_FOUND))?;
    let loan = state
        .store()
        .get(id)
        .await?
        .ok_or(ApiError::NotFound(MSG_LOAN_NOT_FOUND))?;
    Ok(Json(LoanResponse {
        success: true,
        loan,
    }))
}
