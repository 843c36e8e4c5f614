//! Chat orchestration.
//!
//! One user message runs as a single critical section on its loan:
//!
//! 1. Load the loan (or create one at `INIT`).
//! 2. Ask the decision engine what happens next.
//! 3. On a decision, merge its patch and stage into the loan, persist, and
//!    queue a `stage: <STAGE>` audit entry tagged with the answering agent.
//! 4. If the engine is unavailable, answer from the fallback script and leave
//!    the loan untouched.
//!
//! Administrative overrides go through the same per-loan lock.
//!
//! Both run on their own task: dropping the caller's future (for example when
//! an HTTP client disconnects) does not cancel a write or its audit entry.

use std::sync::Arc;

use loanflow_audit::{AuditEntry, AuditOutbox};
use loanflow_core::{LoanApplication, LoanUpdate, RiskLevel, Stage, TransitionPolicy};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{Decision, DecisionEngine, DecisionRequest};
use crate::fallback::fallback_reply;
use crate::locks::LoanLocks;
use crate::store::{LoanStore, StoreError};

/// Patch key the engine uses to report a risk band.
pub const RISK_LEVEL_KEY: &str = "risk_level";

/// Attempts at a versioned write before giving up on a conflict.
const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("loan {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(StoreError),

    #[error("loan task did not finish: {0}")]
    Interrupted(#[from] tokio::task::JoinError),
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ChatError::NotFound(id),
            other => ChatError::Store(other),
        }
    }
}

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
    pub reply: String,
    pub loan_id: Uuid,
    pub stage: Stage,
    pub completed: bool,
    /// The reply came from the fallback script.
    #[serde(skip)]
    pub degraded: bool,
}

/// An administrative change to a loan.
#[derive(Debug, Clone, Default)]
pub struct LoanOverride {
    pub stage: Option<Stage>,
    pub risk_level: Option<RiskLevel>,
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    store: Arc<dyn LoanStore>,
    engine: Arc<dyn DecisionEngine>,
    audit: AuditOutbox,
    locks: LoanLocks,
    policy: TransitionPolicy,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn LoanStore>,
        engine: Arc<dyn DecisionEngine>,
        audit: AuditOutbox,
    ) -> Self {
        Self {
            store,
            engine,
            audit,
            locks: LoanLocks::new(),
            policy: TransitionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn LoanStore> {
        &self.store
    }

    /// Handle one user message.
    pub async fn handle_message(
        &self,
        text: &str,
        loan_id: Option<Uuid>,
        owner_id: &str,
    ) -> Result<ChatOutcome, ChatError> {
        let this = self.clone();
        let text = text.to_string();
        let owner_id = owner_id.to_string();
        tokio::spawn(async move { this.run_message(&text, loan_id, &owner_id).await }).await?
    }

    async fn run_message(
        &self,
        text: &str,
        loan_id: Option<Uuid>,
        owner_id: &str,
    ) -> Result<ChatOutcome, ChatError> {
        let loan = self.store.get_or_create(loan_id, owner_id).await?;
        let _guard = self.locks.lock(loan.id).await;

        // Re-read under the lock; a concurrent message may have moved it on.
        let loan = match loan_id {
            Some(id) => self.store.get(id).await?.ok_or(ChatError::NotFound(id))?,
            None => loan,
        };
        if loan.stage.is_terminal() {
            tracing::info!(loan_id = %loan.id, stage = %loan.stage, "Message received for a finished application");
        }

        let request = DecisionRequest::new(loan.id, loan.stage, &loan.data, text);
        match self.engine.decide(&request).await {
            Ok(decision) => self.apply_decision(loan, decision, owner_id).await,
            Err(err) => {
                tracing::warn!(
                    loan_id = %loan.id,
                    stage = %loan.stage,
                    "Decision engine unavailable, using fallback reply: {}",
                    err
                );
                Ok(ChatOutcome {
                    reply: fallback_reply(loan.stage, text).to_string(),
                    loan_id: loan.id,
                    stage: loan.stage,
                    completed: false,
                    degraded: true,
                })
            }
        }
    }

    async fn apply_decision(
        &self,
        loan: LoanApplication,
        decision: Decision,
        actor_id: &str,
    ) -> Result<ChatOutcome, ChatError> {
        let mut update = LoanUpdate::new().data_patch(decision.data_patch.clone());
        if let Some(raw) = decision.data_patch.get(RISK_LEVEL_KEY) {
            match RiskLevel::from_value(raw) {
                Some(level) => update = update.risk_level(level),
                None => tracing::warn!(
                    loan_id = %loan.id,
                    value = %raw,
                    "Ignoring unrecognised risk level from decision engine"
                ),
            }
        }

        let saved = self
            .write_with_retry(loan, |current| {
                let mut update = update.clone();
                if let Some(next) = decision.stage {
                    if self.policy.permits(current.stage, next) {
                        update.stage = Some(next);
                    } else {
                        tracing::warn!(
                            loan_id = %current.id,
                            from = %current.stage,
                            to = %next,
                            "Refusing backward stage transition"
                        );
                    }
                }
                update
            })
            .await?;

        self.audit.submit_or_log(AuditEntry::stage_change(
            saved.id,
            actor_id,
            decision.agent.as_str(),
            saved.stage,
        ));

        Ok(ChatOutcome {
            reply: decision.reply,
            loan_id: saved.id,
            stage: saved.stage,
            completed: decision.completed,
            degraded: false,
        })
    }

    /// Apply an administrative override and record it.
    pub async fn apply_override(
        &self,
        loan_id: Uuid,
        change: &LoanOverride,
        actor_id: &str,
    ) -> Result<LoanApplication, ChatError> {
        let this = self.clone();
        let change = change.clone();
        let actor_id = actor_id.to_string();
        tokio::spawn(async move { this.run_override(loan_id, &change, &actor_id).await }).await?
    }

    async fn run_override(
        &self,
        loan_id: Uuid,
        change: &LoanOverride,
        actor_id: &str,
    ) -> Result<LoanApplication, ChatError> {
        let _guard = self.locks.lock(loan_id).await;
        let loan = self
            .store
            .get(loan_id)
            .await?
            .ok_or(ChatError::NotFound(loan_id))?;

        let mut update = LoanUpdate::new();
        update.stage = change.stage;
        update.risk_level = change.risk_level;
        let saved = self.write_with_retry(loan, |_| update.clone()).await?;

        self.audit.submit_or_log(AuditEntry::manual_update(
            saved.id,
            actor_id,
            change.notes.as_deref(),
        ));
        tracing::info!(loan_id = %saved.id, stage = %saved.stage, actor = %actor_id, "Loan overridden");
        Ok(saved)
    }

    /// Persist `make_update(loan)`, reloading and rebuilding the update when
    /// another writer got there first.
    async fn write_with_retry<F>(
        &self,
        mut loan: LoanApplication,
        make_update: F,
    ) -> Result<LoanApplication, ChatError>
    where
        F: Fn(&LoanApplication) -> LoanUpdate,
    {
        let mut attempt = 1;
        loop {
            let update = make_update(&loan);
            match self.store.apply_update(&loan, &update).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::Conflict { id, .. }) if attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!(loan_id = %id, attempt, "Version conflict, reloading loan");
                    loan = self.store.get(id).await?.ok_or(ChatError::NotFound(id))?;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::fallback::{ASK_AMOUNT, ASK_IDENTITY};
    use crate::store::MemoryLoanStore;
    use async_trait::async_trait;
    use loanflow_audit::{AuditFilter, AuditLogger};
    use loanflow_core::OutboxConfig;
    use serde_json::{Map, Value, json};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays canned answers; an exhausted script behaves like an outage.
    struct ScriptedEngine {
        answers: Mutex<Vec<Result<Decision, EngineError>>>,
        seen: Mutex<Vec<DecisionRequest>>,
        delay: Duration,
    }

    impl ScriptedEngine {
        fn new(answers: Vec<Result<Decision, EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            })
        }

        fn slow(answers: Vec<Result<Decision, EngineError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
                delay,
            })
        }
    }

    #[async_trait]
    impl DecisionEngine for ScriptedEngine {
        async fn decide(&self, request: &DecisionRequest) -> Result<Decision, EngineError> {
            self.seen.lock().unwrap().push(request.clone());
            tokio::time::sleep(self.delay).await;
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(EngineError::Transport("connection refused".to_string())))
        }
    }

    fn decision(agent: &str, stage: Option<Stage>, patch: Value) -> Result<Decision, EngineError> {
        Ok(Decision {
            agent: agent.to_string(),
            data_patch: patch.as_object().cloned().unwrap_or_else(Map::new),
            reply: format!("{agent} says hi"),
            completed: stage == Some(Stage::Complete),
            stage,
        })
    }

    struct Harness {
        orchestrator: Arc<ChatOrchestrator>,
        store: Arc<MemoryLoanStore>,
        logger: Arc<AuditLogger>,
        outbox: AuditOutbox,
    }

    fn harness(engine: Arc<dyn DecisionEngine>) -> Harness {
        let store = Arc::new(MemoryLoanStore::new());
        let logger = Arc::new(AuditLogger::in_memory());
        let (outbox, _worker) = AuditOutbox::spawn(logger.clone(), &OutboxConfig::default());
        let orchestrator = Arc::new(ChatOrchestrator::new(
            store.clone(),
            engine,
            outbox.clone(),
        ));
        Harness {
            orchestrator,
            store,
            logger,
            outbox,
        }
    }

    #[tokio::test]
    async fn test_decision_is_applied_and_audited() {
        let engine = ScriptedEngine::new(vec![decision(
            "sales_agent",
            Some(Stage::Sales),
            json!({ "loan_type": "personal", "risk_level": "low" }),
        )]);
        let h = harness(engine.clone());

        let outcome = h
            .orchestrator
            .handle_message("I need a personal loan", None, "u1")
            .await
            .unwrap();
        assert_eq!(outcome.stage, Stage::Sales);
        assert_eq!(outcome.reply, "sales_agent says hi");
        assert!(!outcome.degraded);

        let stored = h.store.get(outcome.loan_id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Sales);
        assert_eq!(stored.data["loan_type"], json!("personal"));
        assert_eq!(stored.risk_level, Some(RiskLevel::Low));

        let sent = engine.seen.lock().unwrap().clone();
        assert_eq!(sent[0].current_state, Stage::Init);
        assert_eq!(sent[0].user_message, "I need a personal loan");

        h.outbox.flush().await;
        let entries = h.logger.for_loan(outcome.loan_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].agent, "sales_agent");
        assert_eq!(entries[0].action, "stage: SALES");
        assert_eq!(entries[0].actor_id, "u1");
    }

    #[tokio::test]
    async fn test_completion_scenario() {
        let engine = ScriptedEngine::new(vec![decision(
            "sanction_agent",
            Some(Stage::Complete),
            json!({ "approved_amount": 500000 }),
        )]);
        let h = harness(engine);

        let outcome = h
            .orchestrator
            .handle_message("yes, I accept", None, "u1")
            .await
            .unwrap();
        assert!(outcome.completed);

        let stored = h.store.get(outcome.loan_id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Complete);
        assert_eq!(stored.data["approved_amount"], json!(500000));

        h.outbox.flush().await;
        let actions: Vec<String> = h
            .logger
            .for_loan(outcome.loan_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["stage: COMPLETE".to_string()]);
    }

    #[tokio::test]
    async fn test_engine_outage_falls_back_without_mutation() {
        let h = harness(ScriptedEngine::new(vec![]));

        let outcome = h
            .orchestrator
            .handle_message("I need a personal loan", None, "guest")
            .await
            .unwrap();
        assert_eq!(outcome.reply, ASK_AMOUNT);
        assert_eq!(outcome.stage, Stage::Init);
        assert!(!outcome.completed);
        assert!(outcome.degraded);

        let stored = h.store.get(outcome.loan_id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Init);
        assert!(stored.data.is_empty());
        assert_eq!(stored.version, 0);

        h.outbox.flush().await;
        assert!(h.logger.for_loan(outcome.loan_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_uses_current_stage() {
        let engine = ScriptedEngine::new(vec![decision("kyc_agent", Some(Stage::Kyc), json!({}))]);
        let h = harness(engine);

        let first = h.orchestrator.handle_message("hi", None, "u1").await.unwrap();
        let second = h
            .orchestrator
            .handle_message("ABCDE1234F", Some(first.loan_id), "u1")
            .await
            .unwrap();
        assert_eq!(second.reply, ASK_IDENTITY);
        assert_eq!(second.stage, Stage::Kyc);
    }

    #[tokio::test]
    async fn test_unknown_loan_is_not_found() {
        let h = harness(ScriptedEngine::new(vec![]));
        let missing = Uuid::new_v4();
        let err = h
            .orchestrator
            .handle_message("hello", Some(missing), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_decision_without_stage_keeps_stage() {
        let engine = ScriptedEngine::new(vec![
            decision("sales_agent", Some(Stage::Sales), json!({})),
            decision("sales_agent", None, json!({ "amount": 75000 })),
        ]);
        let h = harness(engine);

        let first = h.orchestrator.handle_message("loan", None, "u1").await.unwrap();
        let second = h
            .orchestrator
            .handle_message("75000", Some(first.loan_id), "u1")
            .await
            .unwrap();
        assert_eq!(second.stage, Stage::Sales);

        h.outbox.flush().await;
        let entries = h.logger.for_loan(first.loan_id).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.action == "stage: SALES"));
    }

    #[tokio::test]
    async fn test_forward_only_policy_refuses_regression() {
        let engine = ScriptedEngine::new(vec![
            decision("credit_agent", Some(Stage::Credit), json!({})),
            decision("sales_agent", Some(Stage::Sales), json!({ "note": "kept" })),
        ]);
        let store = Arc::new(MemoryLoanStore::new());
        let (outbox, _worker) =
            AuditOutbox::spawn(Arc::new(AuditLogger::in_memory()), &OutboxConfig::default());
        let orchestrator = ChatOrchestrator::new(store.clone(), engine, outbox)
            .with_policy(TransitionPolicy::ForwardOnly);

        let first = orchestrator.handle_message("go", None, "u1").await.unwrap();
        let second = orchestrator
            .handle_message("back", Some(first.loan_id), "u1")
            .await
            .unwrap();
        assert_eq!(second.stage, Stage::Credit);

        let stored = store.get(first.loan_id).await.unwrap().unwrap();
        assert_eq!(stored.data["note"], json!("kept"));
    }

    #[tokio::test]
    async fn test_invalid_risk_level_is_ignored() {
        let engine = ScriptedEngine::new(vec![decision(
            "credit_agent",
            Some(Stage::Credit),
            json!({ "risk_level": "EXTREME" }),
        )]);
        let h = harness(engine);

        let outcome = h.orchestrator.handle_message("go", None, "u1").await.unwrap();
        let stored = h.store.get(outcome.loan_id).await.unwrap().unwrap();
        assert_eq!(stored.risk_level, None);
        assert_eq!(stored.data["risk_level"], json!("EXTREME"));
    }

    #[tokio::test]
    async fn test_concurrent_messages_keep_every_patch() {
        let answers = (0..6)
            .map(|i| {
                let mut patch = Map::new();
                patch.insert(format!("field_{i}"), json!(i));
                decision("sales_agent", None, Value::Object(patch))
            })
            .collect();
        let engine = ScriptedEngine::slow(answers, Duration::from_millis(5));
        let h = harness(engine);
        let loan_id = h.store.get_or_create(None, "u1").await.unwrap().id;

        let mut tasks = Vec::new();
        for i in 0..6 {
            let orchestrator = h.orchestrator.clone();
            tasks.push(tokio::spawn(async move {
                orchestrator
                    .handle_message(&format!("message {i}"), Some(loan_id), "u1")
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = h.store.get(loan_id).await.unwrap().unwrap();
        assert_eq!(stored.data.len(), 6);
        assert_eq!(stored.version, 6);
    }

    #[tokio::test]
    async fn test_admin_override() {
        let h = harness(ScriptedEngine::new(vec![]));
        let loan = h.store.get_or_create(None, "u1").await.unwrap();

        let saved = h
            .orchestrator
            .apply_override(
                loan.id,
                &LoanOverride {
                    stage: Some(Stage::Offer),
                    risk_level: Some(RiskLevel::High),
                    notes: Some("manual review".to_string()),
                },
                "admin-1",
            )
            .await
            .unwrap();
        assert_eq!(saved.stage, Stage::Offer);
        assert_eq!(saved.risk_level, Some(RiskLevel::High));

        h.outbox.flush().await;
        let entries = h
            .logger
            .query(AuditFilter {
                agent: Some("admin".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "Manual update: manual review");
        assert_eq!(entries[0].actor_id, "admin-1");
    }

    #[tokio::test]
    async fn test_override_missing_loan() {
        let h = harness(ScriptedEngine::new(vec![]));
        let err = h
            .orchestrator
            .apply_override(Uuid::new_v4(), &LoanOverride::default(), "admin-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    /// Memory store whose writes take a while to land.
    struct SlowSaveStore {
        inner: MemoryLoanStore,
        delay: Duration,
    }

    #[async_trait]
    impl LoanStore for SlowSaveStore {
        async fn insert(&self, loan: &LoanApplication) -> Result<(), StoreError> {
            self.inner.insert(loan).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<LoanApplication>, StoreError> {
            self.inner.get(id).await
        }

        async fn save(&self, loan: &LoanApplication) -> Result<LoanApplication, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.save(loan).await
        }

        async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<LoanApplication>, StoreError> {
            self.inner.list_by_owner(owner_id).await
        }
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_write() {
        let store = Arc::new(SlowSaveStore {
            inner: MemoryLoanStore::new(),
            delay: Duration::from_millis(100),
        });
        let engine = ScriptedEngine::new(vec![decision(
            "sanction_agent",
            Some(Stage::Complete),
            json!({ "approved_amount": 500000 }),
        )]);
        let logger = Arc::new(AuditLogger::in_memory());
        let (outbox, _worker) = AuditOutbox::spawn(logger.clone(), &OutboxConfig::default());
        let orchestrator = ChatOrchestrator::new(store.clone(), engine, outbox.clone());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(30),
            orchestrator.handle_message("I accept", None, "u1"),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let loans = store.list_by_owner("u1").await.unwrap();
        assert_eq!(loans.len(), 1);
        assert_eq!(loans[0].stage, Stage::Complete);
        assert_eq!(loans[0].data["approved_amount"], json!(500000));

        outbox.flush().await;
        let entries = logger.for_loan(loans[0].id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "stage: COMPLETE");
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_override() {
        let store = Arc::new(SlowSaveStore {
            inner: MemoryLoanStore::new(),
            delay: Duration::from_millis(100),
        });
        let logger = Arc::new(AuditLogger::in_memory());
        let (outbox, _worker) = AuditOutbox::spawn(logger.clone(), &OutboxConfig::default());
        let orchestrator =
            ChatOrchestrator::new(store.clone(), ScriptedEngine::new(vec![]), outbox.clone());
        let loan = store.get_or_create(None, "u1").await.unwrap();

        let change = LoanOverride {
            stage: Some(Stage::Sanction),
            ..Default::default()
        };
        let abandoned = tokio::time::timeout(
            Duration::from_millis(30),
            orchestrator.apply_override(loan.id, &change, "admin-1"),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stored = store.get(loan.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, Stage::Sanction);

        outbox.flush().await;
        let entries = logger.for_loan(loan.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "Manual update: State changed");
    }
}
