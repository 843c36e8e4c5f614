//! Administrative routes.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use loanflow_audit::{AuditEntry, AuditFilter};
use loanflow_core::{LoanApplication, RiskLevel, Stage};
use loanflow_runtime::LoanOverride;
use serde::{Deserialize, Serialize};

use super::chat::parse_loan_id;
use crate::error::{ApiError, MSG_LOAN_NOT_FOUND};
use crate::middleware::AdminPrincipal;
use crate::state::AppState;

const DEFAULT_AUDIT_PAGE_SIZE: usize = 50;
const MAX_AUDIT_PAGE_SIZE: usize = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    #[serde(default, alias = "state")]
    pub stage: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl OverrideRequest {
    fn into_override(self) -> Result<LoanOverride, ApiError> {
        let stage = non_blank(self.stage)
            .map(|s| s.parse::<Stage>())
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let risk_level = non_blank(self.risk_level)
            .map(|r| r.parse::<RiskLevel>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        Ok(LoanOverride {
            stage,
            risk_level,
            notes: self.notes,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Serialize)]
pub struct OverrideResponse {
    pub success: bool,
    pub loan: LoanApplication,
}

/// `PATCH /api/admin/loans/{loan_id}`
pub async fn override_loan(
    State(state): State<AppState>,
    AdminPrincipal(admin): AdminPrincipal,
    Path(loan_id): Path<String>,
    body: Result<Json<OverrideRequest>, JsonRejection>,
) -> Result<Json<OverrideResponse>, ApiError> {
    let loan_id = parse_loan_id(Some(&loan_id))?.ok_or(ApiError::NotFound(MSG_LOAN_NOT_FOUND))?;
    let Json(body) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let change = body.into_override()?;

    let loan = state
        .orchestrator()
        .apply_override(loan_id, &change, &admin.user_id)
        .await?;
    Ok(Json(OverrideResponse {
        success: true,
        loan,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    #[serde(default)]
    pub loan_id: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    pub success: bool,
    pub audits: Vec<AuditEntry>,
    pub current_page: usize,
}

/// `GET /api/admin/audit`
pub async fn list_audit(
    State(state): State<AppState>,
    _admin: AdminPrincipal,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditResponse>, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_PAGE_SIZE)
        .clamp(1, MAX_AUDIT_PAGE_SIZE);

    let mut filter = AuditFilter {
        limit: Some(limit),
        offset: Some((page - 1).saturating_mul(limit)),
        ..Default::default()
    };
    if let Some(raw) = non_blank(query.loan_id) {
        match parse_loan_id(Some(&raw)) {
            Ok(id) => filter.loan_id = id,
            // No entry can reference a loan id that is not a UUID.
            Err(_) => {
                return Ok(Json(AuditResponse {
                    success: true,
                    audits: Vec::new(),
                    current_page: page,
                }));
            }
        }
    }

    let audits = state.audit().query(filter).await?;
    Ok(Json(AuditResponse {
        success: true,
        audits,
        current_page: page,
    }))
}
