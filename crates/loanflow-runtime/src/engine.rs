//! Decision engine client.
//!
//! The engine is an external HTTP service that owns every underwriting
//! decision. One message produces one `POST {base_url}/master`; anything
//! other than a timely 2xx with a well-formed body is reported as
//! [`EngineError`], which callers treat as "engine unavailable".

use std::time::Duration;

use async_trait::async_trait;
use loanflow_core::{EngineConfig, Stage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Agent name recorded when the engine does not name one.
pub const DEFAULT_AGENT: &str = "master_agent";

/// Every way the engine can fail to produce a decision.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decision engine timed out after {0:?}")]
    Timeout(Duration),

    #[error("decision engine unreachable: {0}")]
    Transport(String),

    #[error("decision engine returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decision engine response malformed: {0}")]
    Malformed(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Body of the outbound call.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub loan_id: String,
    pub user_message: String,
    pub current_state: Stage,
    pub loan_data: Map<String, Value>,
}

impl DecisionRequest {
    pub fn new(loan_id: Uuid, stage: Stage, data: &Map<String, Value>, text: &str) -> Self {
        Self {
            loan_id: loan_id.to_string(),
            user_message: text.to_string(),
            current_state: stage,
            loan_data: data.clone(),
        }
    }
}

/// Wire shape of the engine's answer.
#[derive(Debug, Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    next_agent: Option<String>,
    #[serde(default)]
    state_update: Option<Map<String, Value>>,
    user_message: String,
    #[serde(default)]
    completed: Option<bool>,
    #[serde(default)]
    state: Option<String>,
}

/// A parsed engine decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Name of the agent that answered.
    pub agent: String,
    pub data_patch: Map<String, Value>,
    pub reply: String,
    pub completed: bool,
    /// New stage, when the engine moved the application.
    pub stage: Option<Stage>,
}

impl TryFrom<DecisionResponse> for Decision {
    type Error = EngineError;

    fn try_from(response: DecisionResponse) -> Result<Self, Self::Error> {
        let stage = match response.state.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<Stage>()
                    .map_err(|e| EngineError::Malformed(e.to_string()))?,
            ),
        };

        Ok(Self {
            agent: response
                .next_agent
                .filter(|a| !a.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_AGENT.to_string()),
            data_patch: response.state_update.unwrap_or_default(),
            reply: response.user_message,
            completed: response.completed.unwrap_or(false),
            stage,
        })
    }
}

#[async_trait]
pub trait DecisionEngine: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError>;
}

/// [`DecisionEngine`] over HTTP.
pub struct HttpDecisionEngine {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpDecisionEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let timeout = config.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| EngineError::Client(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/master", config.base_url.trim_end_matches('/')),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn classify(&self, err: reqwest::Error) -> EngineError {
        if err.is_timeout() {
            EngineError::Timeout(self.timeout)
        } else if err.is_decode() {
            EngineError::Malformed(err.to_string())
        } else {
            EngineError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl DecisionEngine for HttpDecisionEngine {
    async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: DecisionResponse = response.json().await.map_err(|err| self.classify(err))?;
        let decision = Decision::try_from(payload)?;

        tracing::debug!(
            loan_id = %request.loan_id,
            agent = %decision.agent,
            stage = ?decision.stage,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Decision engine answered"
        );
        Ok(decision)
    }
}
