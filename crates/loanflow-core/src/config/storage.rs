//! Loan store configuration.

use serde::{Deserialize, Serialize};

/// Where loan applications (and shared counters) are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// SQLite database file used by the `sqlite` backends.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

/// Loan store backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl StorageConfig {
    /// sqlx connection URL for [`Self::sqlite_path`].
    pub fn sqlite_url(&self) -> String {
        if self.sqlite_path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", self.sqlite_path)
        }
    }
}

fn default_sqlite_path() -> String {
    "data/loanflow.sqlite".to_string()
}
