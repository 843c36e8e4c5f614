//! Error types for the audit crate.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to initialize the audit storage.
    #[error("failed to initialize audit storage: {0}")]
    InitializationFailed(String),

    /// An entry with this id is already persisted. Entries are write-once.
    #[error("audit entries cannot be modified (entry {0})")]
    ImmutableEntry(Uuid),

    /// Storage error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// The outbox queue is at capacity.
    #[error("audit outbox is full")]
    QueueFull,

    /// The outbox worker has stopped.
    #[error("audit outbox is closed")]
    Closed,

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
