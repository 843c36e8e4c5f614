//! Decision engine client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable that overrides [`EngineConfig::base_url`].
pub const ENGINE_URL_ENV: &str = "AGENT_SERVICE_URL";

/// Where and how to reach the external decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL; requests go to `{base_url}/master`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Hard deadline for one decision call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}
