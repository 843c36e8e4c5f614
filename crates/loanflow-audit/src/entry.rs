//! Audit entry type.
//!
//! An entry records one action taken against the system or a loan. The
//! serialized shape is `{ id, loanId?, userId, agent, action, timestamp,
//! metadata }`; once persisted an entry is never changed.

use chrono::{DateTime, Utc};
use loanflow_core::Stage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Actor id used when no authenticated user is attached to a request.
pub const ACTOR_ANONYMOUS: &str = "anonymous";

/// Agent name for entries written by the request pipeline.
pub const AGENT_SYSTEM: &str = "system";

/// Agent name for manual overrides.
pub const AGENT_ADMIN: &str = "admin";

/// An immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique entry ID.
    pub id: Uuid,

    /// The loan application this entry refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_id: Option<Uuid>,

    /// Who triggered the action (user id, "guest", "anonymous", ...).
    #[serde(rename = "userId")]
    pub actor_id: String,

    /// Which subsystem or decision-engine role performed the action.
    pub agent: String,

    /// What happened.
    pub action: String,

    /// When the entry was created.
    pub timestamp: DateTime<Utc>,

    /// Contextual detail (status code, duration, client address, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AuditEntry {
    pub fn new(
        actor_id: impl Into<String>,
        agent: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            loan_id: None,
            actor_id: actor_id.into(),
            agent: agent.into(),
            action: action.into(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Create a builder for an audit entry.
    pub fn builder(
        actor_id: impl Into<String>,
        agent: impl Into<String>,
        action: impl Into<String>,
    ) -> AuditEntryBuilder {
        AuditEntryBuilder {
            entry: Self::new(actor_id, agent, action),
        }
    }

    /// Entry for a completed HTTP request on a sensitive route.
    pub fn request(
        actor_id: impl Into<String>,
        method: &str,
        path: &str,
        status: u16,
        duration_ms: u64,
        client_ip: &str,
    ) -> Self {
        Self::builder(actor_id, AGENT_SYSTEM, format!("{method} {path}"))
            .meta("statusCode", status)
            .meta("duration", duration_ms)
            .meta("ip", client_ip)
            .build()
    }

    /// Entry for a stage decided by the engine.
    pub fn stage_change(
        loan_id: Uuid,
        actor_id: impl Into<String>,
        agent: impl Into<String>,
        stage: Stage,
    ) -> Self {
        Self::builder(actor_id, agent, format!("stage: {stage}"))
            .loan_id(loan_id)
            .build()
    }

    /// Entry for an administrative override.
    pub fn manual_update(loan_id: Uuid, actor_id: impl Into<String>, notes: Option<&str>) -> Self {
        let notes = notes
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("State changed");
        Self::builder(actor_id, AGENT_ADMIN, format!("Manual update: {notes}"))
            .loan_id(loan_id)
            .build()
    }

    /// Format the entry as a human-readable log line.
    ///
    /// Format: `[timestamp] agent=... user=... action="..." [loan=...] [k=v ...]`
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] agent={} user={} action=\"{}\"",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.agent,
            self.actor_id,
            self.action.replace('"', "'"),
        );

        if let Some(loan_id) = self.loan_id {
            line.push_str(&format!(" loan={loan_id}"));
        }

        for (key, value) in &self.metadata {
            match value {
                Value::String(s) => line.push_str(&format!(" {key}={s}")),
                other => line.push_str(&format!(" {key}={other}")),
            }
        }

        line
    }
}

/// Builder for creating audit entries.
#[derive(Debug)]
pub struct AuditEntryBuilder {
    entry: AuditEntry,
}

impl AuditEntryBuilder {
    pub fn loan_id(mut self, loan_id: Uuid) -> Self {
        self.entry.loan_id = Some(loan_id);
        self
    }

    /// Add one metadata key.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entry.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace all metadata.
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.entry.metadata = metadata;
        self
    }

    pub fn build(self) -> AuditEntry {
        self.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_entry() {
        let entry = AuditEntry::request(ACTOR_ANONYMOUS, "POST", "/api/chat/message", 200, 12, "10.0.0.7");

        assert_eq!(entry.action, "POST /api/chat/message");
        assert_eq!(entry.agent, AGENT_SYSTEM);
        assert_eq!(entry.actor_id, "anonymous");
        assert_eq!(entry.loan_id, None);
        assert_eq!(entry.metadata["statusCode"], json!(200));
        assert_eq!(entry.metadata["duration"], json!(12));
        assert_eq!(entry.metadata["ip"], json!("10.0.0.7"));
    }

    #[test]
    fn test_stage_change_entry() {
        let loan_id = Uuid::new_v4();
        let entry = AuditEntry::stage_change(loan_id, "guest", "kyc_agent", Stage::Kyc);

        assert_eq!(entry.action, "stage: KYC");
        assert_eq!(entry.agent, "kyc_agent");
        assert_eq!(entry.loan_id, Some(loan_id));
    }

    #[test]
    fn test_manual_update_entry() {
        let loan_id = Uuid::new_v4();
        assert_eq!(
            AuditEntry::manual_update(loan_id, "admin-1", None).action,
            "Manual update: State changed"
        );
        assert_eq!(
            AuditEntry::manual_update(loan_id, "admin-1", Some("fraud review")).action,
            "Manual update: fraud review"
        );
        assert_eq!(
            AuditEntry::manual_update(loan_id, "admin-1", Some("  ")).action,
            "Manual update: State changed"
        );
    }

    #[test]
    fn test_serialized_shape() {
        let entry = AuditEntry::stage_change(Uuid::new_v4(), "u1", "sales_agent", Stage::Sales);
        let value = serde_json::to_value(&entry).unwrap();

        assert_eq!(value["userId"], json!("u1"));
        assert!(value.get("loanId").is_some());
        assert!(value.get("actorId").is_none());
        assert_eq!(value["metadata"], json!({}));

        let back: AuditEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_to_log_line() {
        let line = AuditEntry::request("u1", "GET", "/api/admin/loans", 403, 3, "127.0.0.1").to_log_line();
        assert!(line.contains("agent=system"));
        assert!(line.contains("user=u1"));
        assert!(line.contains("action=\"GET /api/admin/loans\""));
        assert!(line.contains("statusCode=403"));
        assert!(line.contains("ip=127.0.0.1"));
    }
}
