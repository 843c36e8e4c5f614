//! Loan application storage.
//!
//! Stores only know how to insert, fetch and save whole records. Saves are
//! optimistic: a record is written only if the stored `version` still matches
//! the one that was read, so a stale writer gets [`StoreError::Conflict`]
//! instead of silently overwriting newer data.

use async_trait::async_trait;
use loanflow_core::{LoanApplication, LoanUpdate};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("loan {0} not found")]
    NotFound(Uuid),

    #[error("loan {id} was modified concurrently (expected version {expected})")]
    Conflict { id: Uuid, expected: u64 },

    #[error("loan {0} already exists")]
    AlreadyExists(Uuid),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait LoanStore: Send + Sync {
    /// Persist a new record.
    async fn insert(&self, loan: &LoanApplication) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<LoanApplication>, StoreError>;

    /// Write `loan` if the stored version equals `loan.version`.
    ///
    /// Returns the record as stored, with its version bumped.
    async fn save(&self, loan: &LoanApplication) -> Result<LoanApplication, StoreError>;

    /// Records owned by `owner_id`, newest first.
    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<LoanApplication>, StoreError>;

    /// Cheap reachability check for health probes.
    async fn ping(&self) -> bool {
        true
    }

    /// Load `loan_id`, or create a fresh `INIT` record for `owner_id` when no
    /// id is given.
    async fn get_or_create(
        &self,
        loan_id: Option<Uuid>,
        owner_id: &str,
    ) -> Result<LoanApplication, StoreError> {
        match loan_id {
            Some(id) => self.get(id).await?.ok_or(StoreError::NotFound(id)),
            None => {
                let loan = LoanApplication::new(owner_id);
                self.insert(&loan).await?;
                tracing::info!(loan_id = %loan.id, owner = %owner_id, "Created loan application");
                Ok(loan)
            }
        }
    }

    /// Merge `update` into `loan` and persist.
    async fn apply_update(
        &self,
        loan: &LoanApplication,
        update: &LoanUpdate,
    ) -> Result<LoanApplication, StoreError> {
        let mut next = loan.clone();
        update.apply_to(&mut next);
        self.save(&next).await
    }
}

/// In-process store.
#[derive(Default)]
pub struct MemoryLoanStore {
    loans: RwLock<HashMap<Uuid, LoanApplication>>,
}

impl MemoryLoanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error<T>(err: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Backend(format!("loan store lock poisoned: {err}"))
}

#[async_trait]
impl LoanStore for MemoryLoanStore {
    async fn insert(&self, loan: &LoanApplication) -> Result<(), StoreError> {
        let mut loans = self.loans.write().map_err(lock_error)?;
        if loans.contains_key(&loan.id) {
            return Err(StoreError::AlreadyExists(loan.id));
        }
        loans.insert(loan.id, loan.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<LoanApplication>, StoreError> {
        Ok(self.loans.read().map_err(lock_error)?.get(&id).cloned())
    }

    async fn save(&self, loan: &LoanApplication) -> Result<LoanApplication, StoreError> {
        let mut loans = self.loans.write().map_err(lock_error)?;
        let stored = loans.get_mut(&loan.id).ok_or(StoreError::NotFound(loan.id))?;
        if stored.version != loan.version {
            return Err(StoreError::Conflict {
                id: loan.id,
                expected: loan.version,
            });
        }

        let mut next = loan.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<LoanApplication>, StoreError> {
        let loans = self.loans.read().map_err(lock_error)?;
        let mut owned: Vec<LoanApplication> = loans
            .values()
            .filter(|l| l.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }
}
