//! Shared application state.

use std::sync::Arc;

use loanflow_audit::{AuditError, AuditLogger, AuditOutbox};
use loanflow_core::{AppConfig, StorageBackend};
use loanflow_runtime::{
    ChatOrchestrator, DecisionEngine, EngineError, HttpDecisionEngine, LoanStore,
    MemoryLoanStore, SqliteLoanStore, StoreError,
};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::rate_limit::{RateLimitError, RateLimiter};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("audit setup failed: {0}")]
    Audit(#[from] AuditError),

    #[error("loan store setup failed: {0}")]
    Store(#[from] StoreError),

    #[error("decision engine client setup failed: {0}")]
    Engine(#[from] EngineError),

    #[error("rate limiter setup failed: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("sqlite storage backend needs a database pool")]
    MissingPool,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    orchestrator: ChatOrchestrator,
    audit: Arc<AuditLogger>,
    outbox: AuditOutbox,
    limiter: RateLimiter,
}

impl AppState {
    /// Build every service from configuration, talking to the engine over HTTP.
    pub async fn from_config(
        config: AppConfig,
        pool: Option<SqlitePool>,
    ) -> Result<(Self, JoinHandle<()>), StartupError> {
        let engine = Arc::new(HttpDecisionEngine::new(&config.engine)?);
        tracing::info!(endpoint = %engine.endpoint(), "Decision engine client ready");
        Self::with_engine(config, pool, engine).await
    }

    /// Build every service around a given decision engine.
    ///
    /// Returns the state and the audit outbox worker handle.
    pub async fn with_engine(
        config: AppConfig,
        pool: Option<SqlitePool>,
        engine: Arc<dyn DecisionEngine>,
    ) -> Result<(Self, JoinHandle<()>), StartupError> {
        let store: Arc<dyn LoanStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryLoanStore::new()),
            StorageBackend::Sqlite => {
                let pool = pool.clone().ok_or(StartupError::MissingPool)?;
                Arc::new(SqliteLoanStore::connect(pool).await?)
            }
        };

        let audit = Arc::new(AuditLogger::from_config(&config.audit, pool.clone()).await?);
        let (outbox, worker) = AuditOutbox::spawn(audit.clone(), &config.audit.outbox);
        let limiter = RateLimiter::from_config(&config.rate_limit, pool).await?;

        let orchestrator = ChatOrchestrator::new(store, engine, outbox.clone())
            .with_policy(config.state_machine.transition_policy);

        let state = Self {
            inner: Arc::new(AppStateInner {
                config,
                orchestrator,
                audit,
                outbox,
                limiter,
            }),
        };
        Ok((state, worker))
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn orchestrator(&self) -> &ChatOrchestrator {
        &self.inner.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn LoanStore> {
        self.inner.orchestrator.store()
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.inner.audit
    }

    pub fn outbox(&self) -> &AuditOutbox {
        &self.inner.outbox
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }
}
