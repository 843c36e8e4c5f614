//! Loan application record and its stage machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Owner id recorded for conversations started without a user.
pub const GUEST_OWNER: &str = "guest";

/// Stage of a loan application.
///
/// Variants are declared in journey order, so `Ord` follows the journey:
/// `INIT < SALES < ... < COMPLETE`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Init,
    Sales,
    Kyc,
    Credit,
    Documents,
    Offer,
    Acceptance,
    Sanction,
    Complete,
}

impl Stage {
    /// All stages in journey order.
    pub const ALL: [Stage; 9] = [
        Stage::Init,
        Stage::Sales,
        Stage::Kyc,
        Stage::Credit,
        Stage::Documents,
        Stage::Offer,
        Stage::Acceptance,
        Stage::Sanction,
        Stage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "INIT",
            Stage::Sales => "SALES",
            Stage::Kyc => "KYC",
            Stage::Credit => "CREDIT",
            Stage::Documents => "DOCUMENTS",
            Stage::Offer => "OFFER",
            Stage::Acceptance => "ACCEPTANCE",
            Stage::Sanction => "SANCTION",
            Stage::Complete => "COMPLETE",
        }
    }

    /// Whether this stage ends the journey.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Complete)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not one of the nine stage names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown loan stage: {0:?}")]
pub struct ParseStageError(pub String);

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

/// Risk band assigned during underwriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    /// Read a risk level out of a JSON value, if it names one.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(RiskLevel::Low),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// Which stage changes the orchestrator accepts from the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Any of the nine stages is accepted.
    #[default]
    Open,
    /// Moving to an earlier stage is refused; staying put or moving on is fine.
    ForwardOnly,
}

impl TransitionPolicy {
    pub fn permits(&self, from: Stage, to: Stage) -> bool {
        match self {
            TransitionPolicy::Open => true,
            TransitionPolicy::ForwardOnly => to >= from,
        }
    }
}

/// One loan application and everything collected for it so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanApplication {
    pub id: Uuid,
    pub owner_id: String,
    pub stage: Stage,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every persisted mutation; used for optimistic checks.
    #[serde(default)]
    pub version: u64,
}

impl LoanApplication {
    /// A fresh application at `INIT` with no data.
    pub fn new(owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            stage: Stage::Init,
            data: Map::new(),
            risk_level: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// A mutation to apply to a loan application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoanUpdate {
    pub stage: Option<Stage>,
    pub data_patch: Map<String, Value>,
    pub risk_level: Option<RiskLevel>,
}

impl LoanUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn data_patch(mut self, patch: Map<String, Value>) -> Self {
        self.data_patch = patch;
        self
    }

    pub fn risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    /// Apply onto `loan` in place.
    ///
    /// The data merge is shallow: patch keys overwrite, everything else is
    /// kept. `updated_at` is refreshed; `version` is left to the store.
    pub fn apply_to(&self, loan: &mut LoanApplication) {
        for (key, value) in &self.data_patch {
            loan.data.insert(key.clone(), value.clone());
        }
        if let Some(stage) = self.stage {
            loan.stage = stage;
        }
        if let Some(level) = self.risk_level {
            loan.risk_level = Some(level);
        }
        loan.updated_at = Utc::now();
    }
}
