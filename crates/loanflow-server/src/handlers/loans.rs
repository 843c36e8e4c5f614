//! Owner-facing loan listing.

use axum::Json;
use axum::extract::State;
use loanflow_core::LoanApplication;
use loanflow_runtime::LoanStore;
use serde::Serialize;

use crate::error::ApiError;
use crate::middleware::Principal;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct LoansResponse {
    pub success: bool,
    pub loans: Vec<LoanApplication>,
}

/// `GET /api/loans/user`
pub async fn list_user_loans(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<LoansResponse>, ApiError> {
    let loans = state.store().list_by_owner(&principal.user_id).await?;
    Ok(Json(LoansResponse {
        success: true,
        loans,
    }))
}
