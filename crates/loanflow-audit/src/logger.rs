//! Audit logger implementation.
//!
//! `AuditLogger` is the single entry point for persisting and querying audit
//! entries; which backend it writes to is decided by [`AuditConfig`].

use chrono::{DateTime, Utc};
use loanflow_core::{AuditBackend, AuditConfig};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::entry::AuditEntry;
use crate::error::AuditError;
use crate::sqlite::SqliteStorage;
use crate::storage::{
    AuditStorage, ConsoleStorage, DualStorage, FileStorage, MemoryStorage, NullStorage,
};

/// The main audit logger.
pub struct AuditLogger {
    enabled: bool,
    storage: Arc<dyn AuditStorage>,
}

impl AuditLogger {
    /// Build a logger for the configured backend.
    ///
    /// `pool` is required for the sqlite backend and ignored otherwise.
    pub async fn from_config(
        config: &AuditConfig,
        pool: Option<SqlitePool>,
    ) -> Result<Self, AuditError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let storage: Arc<dyn AuditStorage> = match config.backend {
            AuditBackend::Memory => Arc::new(MemoryStorage::new()),
            AuditBackend::File => Arc::new(FileStorage::new(Self::resolve_log_path(config))?),
            AuditBackend::Sqlite => {
                let pool = pool.ok_or_else(|| {
                    AuditError::InitializationFailed(
                        "sqlite audit backend needs a database pool".to_string(),
                    )
                })?;
                Arc::new(SqliteStorage::connect(pool).await?)
            }
            AuditBackend::Console => {
                return Ok(Self::with_storage(Arc::new(ConsoleStorage)));
            }
        };

        let storage: Arc<dyn AuditStorage> = if config.stdout {
            Arc::new(DualStorage::new(storage))
        } else {
            storage
        };

        Ok(Self::with_storage(storage))
    }

    /// Create a logger with a custom storage backend.
    pub fn with_storage(storage: Arc<dyn AuditStorage>) -> Self {
        Self {
            enabled: true,
            storage,
        }
    }

    /// Create a disabled (no-op) logger.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            storage: Arc::new(NullStorage),
        }
    }

    /// In-memory logger, handy for tests and local runs.
    pub fn in_memory() -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()))
    }

    fn resolve_log_path(config: &AuditConfig) -> PathBuf {
        let mut path = PathBuf::from(&config.directory);
        path.push("audit.log");
        path
    }

    /// Check if logging is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Persist an audit entry.
    pub async fn log(&self, entry: AuditEntry) -> Result<(), AuditError> {
        if !self.enabled {
            return Ok(());
        }

        tracing::debug!(
            entry_id = %entry.id,
            agent = %entry.agent,
            user = %entry.actor_id,
            action = %entry.action,
            "Audit entry"
        );

        self.storage.store(entry).await
    }

    /// Query audit entries with filters.
    pub async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        self.storage.query(filter).await
    }

    /// Get an audit entry by ID.
    pub async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        self.storage.get(id).await
    }

    /// All entries recorded against a loan, newest first.
    pub async fn for_loan(&self, loan_id: Uuid) -> Result<Vec<AuditEntry>, AuditError> {
        self.query(AuditFilter::for_loan(loan_id)).await
    }
}

/// Filter for querying audit entries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub loan_id: Option<Uuid>,
    /// Filter by actor (serialized as `userId`).
    pub actor_id: Option<String>,
    pub agent: Option<String>,
    /// Only entries whose action starts with this text.
    pub action_prefix: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditFilter {
    pub fn for_loan(loan_id: Uuid) -> Self {
        Self {
            loan_id: Some(loan_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(loan_id) = self.loan_id {
            if entry.loan_id != Some(loan_id) {
                return false;
            }
        }
        if let Some(ref actor) = self.actor_id {
            if &entry.actor_id != actor {
                return false;
            }
        }
        if let Some(ref agent) = self.agent {
            if &entry.agent != agent {
                return false;
            }
        }
        if let Some(ref prefix) = self.action_prefix {
            if !entry.action.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if entry.timestamp > end {
                return false;
            }
        }
        true
    }

    /// Filter, sort newest first, then page.
    pub fn apply<'a>(&self, entries: impl Iterator<Item = &'a AuditEntry>) -> Vec<AuditEntry> {
        let mut results: Vec<AuditEntry> = entries.filter(|e| self.matches(e)).cloned().collect();
        // Stable sort keeps insertion order for equal timestamps; reverse after.
        results.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        results.reverse();

        let offset = self.offset.unwrap_or(0);
        results
            .into_iter()
            .skip(offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}
