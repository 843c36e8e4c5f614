//! # loanflow-core
//!
//! Shared domain types and configuration for Loanflow.
//!
//! A [`LoanApplication`] moves through nine [`Stage`]s, driven by an external
//! decision engine. Its `data` map is an open bag of attributes that grows by
//! shallow merges of the patches the engine returns.
//!
//! Configuration is loaded from a single YAML file into [`AppConfig`]; every
//! section has defaults so an empty file is a valid configuration.

pub mod config;
pub mod loan;

pub use config::{
    AppConfig, AuditBackend, AuditConfig, AuthConfig, ConfigError, EngineConfig, Environment,
    LoggingConfig, OutboxConfig, RateLimitBackend, RateLimitConfig, ServerConfig, StateMachineConfig,
    StaticToken, StorageBackend, StorageConfig,
};
pub use loan::{
    LoanApplication, LoanUpdate, ParseStageError, RiskLevel, Stage, TransitionPolicy, GUEST_OWNER,
};
