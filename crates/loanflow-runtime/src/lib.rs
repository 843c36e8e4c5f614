//! # loanflow-runtime
//!
//! The conversational core of Loanflow: loan persistence, the decision
//! engine client, scripted fallback replies, and the orchestrator that ties
//! them together for each incoming message.

pub mod engine;
pub mod fallback;
pub mod locks;
pub mod orchestrator;
pub mod sqlite;
pub mod store;

pub use engine::{
    DEFAULT_AGENT, Decision, DecisionEngine, DecisionRequest, EngineError, HttpDecisionEngine,
};
pub use fallback::fallback_reply;
pub use locks::{LoanGuard, LoanLocks};
pub use orchestrator::{ChatError, ChatOrchestrator, ChatOutcome, LoanOverride, RISK_LEVEL_KEY};
pub use sqlite::SqliteLoanStore;
pub use store::{LoanStore, MemoryLoanStore, StoreError};
