//! Per-loan mutual exclusion.
//!
//! Every read-modify-write of a loan runs while holding that loan's guard, so
//! two messages for the same application are applied one after the other.
//! Entries are removed from the table once nobody holds or waits on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default, Clone)]
pub struct LoanLocks {
    locks: Arc<LockTable>,
}

impl LoanLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `loan_id`.
    pub async fn lock(&self, loan_id: Uuid) -> LoanGuard {
        // Must outlive `acquire`: a cancelled wait drops its mutex reference
        // first, then prunes the entry.
        let _waiting = Waiting {
            loan_id,
            locks: &self.locks,
        };
        let acquire = {
            let mutex = self.locks.entry(loan_id).or_default().clone();
            mutex.lock_owned()
        };
        let guard = acquire.await;
        LoanGuard {
            loan_id,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of loans with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

type LockTable = DashMap<Uuid, Arc<Mutex<()>>>;

/// Drop the entry for `loan_id` once only the table itself references it.
fn prune(locks: &LockTable, loan_id: &Uuid) {
    locks.remove_if(loan_id, |_, mutex| Arc::strong_count(mutex) == 1);
}

struct Waiting<'a> {
    loan_id: Uuid,
    locks: &'a LockTable,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        prune(self.locks, &self.loan_id);
    }
}

pub struct LoanGuard {
    loan_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl Drop for LoanGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune(&self.locks, &self.loan_id);
    }
}
