//! # loanflow-audit
//!
//! Immutable audit trail for Loanflow.
//!
//! This crate provides functionality for:
//! - Building audit entries for pipeline requests, engine decisions and
//!   administrative overrides
//! - Persisting them to memory, a JSON Lines file, SQLite, or the console
//! - Delivering them off the request path through a retrying outbox
//! - Querying history by loan, actor, agent and time range
//!
//! ## Write-once guarantee
//!
//! Entries are never updated or deleted. Every backend refuses to store an id
//! it already holds ([`AuditError::ImmutableEntry`]); the SQLite backend also
//! installs triggers that abort `UPDATE` and `DELETE` on its table.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use loanflow_audit::{AuditEntry, AuditLogger, AuditOutbox};
//! use loanflow_core::AuditConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuditConfig::default();
//! let logger = Arc::new(AuditLogger::from_config(&config, None).await?);
//! let (outbox, _worker) = AuditOutbox::spawn(logger.clone(), &config.outbox);
//!
//! outbox.submit(AuditEntry::request("anonymous", "POST", "/api/chat/message", 200, 42, "10.0.0.1"))?;
//! outbox.flush().await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod error;
pub mod logger;
pub mod outbox;
pub mod sqlite;
pub mod storage;

pub use entry::{ACTOR_ANONYMOUS, AGENT_ADMIN, AGENT_SYSTEM, AuditEntry, AuditEntryBuilder};
pub use error::AuditError;
pub use logger::{AuditFilter, AuditLogger};
pub use outbox::AuditOutbox;
pub use sqlite::SqliteStorage;
pub use storage::{
    AuditStorage, ConsoleStorage, DualStorage, FileStorage, MemoryStorage, NullStorage,
};
