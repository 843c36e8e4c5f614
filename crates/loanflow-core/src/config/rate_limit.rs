//! Request rate limiting configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rolling-window rate limit applied per client identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Requests admitted per identity per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Where window counters live.
    #[serde(default)]
    pub backend: RateLimitBackend,

    /// Only paths under this prefix are limited.
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
}

/// Counter backend for the rate limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackend {
    /// Per-process counters.
    #[default]
    Memory,
    /// Counters in the shared SQLite database, visible to every instance using it.
    Sqlite,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
            backend: RateLimitBackend::default(),
            path_prefix: default_path_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> u32 {
    60
}

fn default_path_prefix() -> String {
    "/api/".to_string()
}
