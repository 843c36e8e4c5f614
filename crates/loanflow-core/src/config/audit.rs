//! Audit trail configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit entries are persisted at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Where entries are persisted.
    #[serde(default)]
    pub backend: AuditBackend,

    /// Directory holding `audit.log` for the file backend.
    #[serde(default = "default_directory")]
    pub directory: String,

    /// Also print each entry as a human-readable line.
    #[serde(default)]
    pub stdout: bool,

    /// Request paths whose requests produce an audit entry (prefix match).
    #[serde(default = "default_sensitive_prefixes")]
    pub sensitive_prefixes: Vec<String>,

    /// Request paths skipped entirely by the request log (prefix match).
    #[serde(default = "default_skip_prefixes")]
    pub skip_prefixes: Vec<String>,

    /// Outbox delivery settings.
    #[serde(default)]
    pub outbox: OutboxConfig,
}

/// Audit storage backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    /// Kept in process memory.
    #[default]
    Memory,
    /// JSON Lines file under `directory`.
    File,
    /// `audit_entries` table in the shared SQLite database.
    Sqlite,
    /// Printed to stdout only.
    Console,
}

/// Delivery settings for the audit outbox worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    /// Maximum number of queued entries before new ones are dropped.
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Attempts per entry before it is dead-lettered to the log.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            backend: AuditBackend::default(),
            directory: default_directory(),
            stdout: false,
            sensitive_prefixes: default_sensitive_prefixes(),
            skip_prefixes: default_skip_prefixes(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl AuditConfig {
    /// Whether a request path should produce a persisted audit entry.
    pub fn is_sensitive(&self, path: &str) -> bool {
        self.sensitive_prefixes.iter().any(|p| path.starts_with(p))
    }

    /// Whether a request path is excluded from request logging.
    pub fn is_skipped(&self, path: &str) -> bool {
        self.skip_prefixes.iter().any(|p| path.starts_with(p))
    }
}

fn default_enabled() -> bool {
    true
}

fn default_directory() -> String {
    "data".to_string()
}

fn default_sensitive_prefixes() -> Vec<String> {
    vec!["/api/chat".to_string(), "/api/admin".to_string()]
}

fn default_skip_prefixes() -> Vec<String> {
    vec!["/health".to_string(), "/static".to_string()]
}

fn default_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}
