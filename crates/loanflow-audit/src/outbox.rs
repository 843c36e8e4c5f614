//! Non-blocking audit delivery.
//!
//! Request handlers hand entries to an [`AuditOutbox`] and move on. A single
//! background worker drains the queue into the [`AuditLogger`], retrying
//! failed writes with exponential backoff. Because storage rejects duplicate
//! ids, a retry of a write that actually landed is detected and counted as
//! delivered, which makes delivery at-least-once without duplicates.
//!
//! Entries are dropped (and logged at `error`) only when the queue is full or
//! every retry failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use loanflow_core::OutboxConfig;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::entry::AuditEntry;
use crate::error::AuditError;
use crate::logger::AuditLogger;

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl From<&OutboxConfig> for RetryPolicy {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

struct Shared {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Shared {
    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Handle for submitting audit entries. Cheap to clone.
#[derive(Clone)]
pub struct AuditOutbox {
    tx: mpsc::Sender<AuditEntry>,
    shared: Arc<Shared>,
}

impl AuditOutbox {
    /// Start the delivery worker on the current tokio runtime.
    pub fn spawn(logger: Arc<AuditLogger>, config: &OutboxConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let shared = Arc::new(Shared {
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let worker = tokio::spawn(run_worker(
            rx,
            logger,
            RetryPolicy::from(config),
            shared.clone(),
        ));

        (Self { tx, shared }, worker)
    }

    /// Queue an entry for delivery without waiting for it to be persisted.
    pub fn submit(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.finish_one();
                let (reason, entry) = match err {
                    mpsc::error::TrySendError::Full(entry) => (AuditError::QueueFull, entry),
                    mpsc::error::TrySendError::Closed(entry) => (AuditError::Closed, entry),
                };
                tracing::error!(
                    entry = %serde_json::to_string(&entry).unwrap_or_default(),
                    "Audit entry dropped: {}",
                    reason
                );
                Err(reason)
            }
        }
    }

    /// Queue an entry, logging instead of returning on failure.
    pub fn submit_or_log(&self, entry: AuditEntry) {
        // submit() has already logged the dropped entry.
        let _ = self.submit(entry);
    }

    /// Number of entries queued or being delivered.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every entry submitted so far has been delivered or dropped.
    pub async fn flush(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<AuditEntry>,
    logger: Arc<AuditLogger>,
    policy: RetryPolicy,
    shared: Arc<Shared>,
) {
    while let Some(entry) = rx.recv().await {
        deliver(&logger, entry, policy).await;
        shared.finish_one();
    }
    tracing::debug!("Audit outbox worker stopped");
}

async fn deliver(logger: &AuditLogger, entry: AuditEntry, policy: RetryPolicy) {
    let mut backoff = policy.initial_backoff;

    for attempt in 1..=policy.max_attempts {
        match logger.log(entry.clone()).await {
            Ok(()) => return,
            Err(AuditError::ImmutableEntry(id)) => {
                tracing::debug!(entry_id = %id, "Audit entry already persisted");
                return;
            }
            Err(err) if attempt < policy.max_attempts => {
                tracing::warn!(
                    entry_id = %entry.id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "Audit write failed, retrying: {}",
                    err
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
            Err(err) => {
                tracing::error!(
                    entry = %serde_json::to_string(&entry).unwrap_or_default(),
                    attempts = attempt,
                    "Audit entry lost after retries: {}",
                    err
                );
            }
        }
    }
}
