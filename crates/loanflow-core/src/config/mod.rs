//! Configuration types for Loanflow.
//!
//! The whole service is configured from one YAML file (`loanflow.yaml` by
//! default). Every section is optional:
//!
//! ```yaml
//! server:
//!   bind: "0.0.0.0:5000"
//!   environment: production
//! engine:
//!   base_url: "http://agents:8000"
//!   timeout_ms: 30000
//! rate_limit:
//!   window_secs: 60
//!   max_requests: 60
//! storage:
//!   backend: sqlite
//!   sqlite_path: data/loanflow.sqlite
//! audit:
//!   backend: sqlite
//! auth:
//!   tokens:
//!     - { token: "s3cret", user_id: "admin-1", role: admin }
//! ```

pub mod audit;
pub mod engine;
pub mod rate_limit;
pub mod server;
pub mod storage;

use crate::loan::TransitionPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use audit::{AuditBackend, AuditConfig, OutboxConfig};
pub use engine::{ENGINE_URL_ENV, EngineConfig};
pub use rate_limit::{RateLimitBackend, RateLimitConfig};
pub use server::{AuthConfig, Environment, ServerConfig, StaticToken};
pub use storage::{StorageBackend, StorageConfig};

/// Complete Loanflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// External decision engine.
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub state_machine: StateMachineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Stage machine behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMachineConfig {
    #[serde(default)]
    pub transition_policy: TransitionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines instead of the human format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content. Blank content yields defaults.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load from `path` if it exists, otherwise start from defaults; then
    /// apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides read through `lookup` (normally the process environment).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENGINE_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.engine.base_url = url;
        }
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.timeout_ms == 0 {
            return Err(ConfigError::Config(
                "engine.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.rate_limit.enabled {
            if self.rate_limit.window_secs == 0 {
                return Err(ConfigError::Config(
                    "rate_limit.window_secs must be greater than zero".to_string(),
                ));
            }
            if self.rate_limit.max_requests == 0 {
                return Err(ConfigError::Config(
                    "rate_limit.max_requests must be greater than zero".to_string(),
                ));
            }
        }
        if self.audit.outbox.capacity == 0 {
            return Err(ConfigError::Config(
                "audit.outbox.capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether any component needs the shared SQLite database.
    pub fn needs_sqlite(&self) -> bool {
        self.storage.backend == StorageBackend::Sqlite
            || (self.audit.enabled && self.audit.backend == AuditBackend::Sqlite)
            || (self.rate_limit.enabled && self.rate_limit.backend == RateLimitBackend::Sqlite)
    }
}
