//! Per-client request limiting over a rolling window.
//!
//! The limiter keeps a log of admitted hits per client identity and admits a
//! request only while fewer than `max_requests` hits fall inside the last
//! `window_secs`. Rejected requests are not logged, so a client that backs
//! off regains capacity as its oldest hits age out.
//!
//! Where the log lives is a [`RateLimitStore`]: process memory, or a table in
//! the shared SQLite database so every instance enforces one cap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use loanflow_core::{RateLimitBackend, RateLimitConfig};
use sqlx::SqlitePool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("rate limiter needs a database pool for the sqlite backend")]
    MissingPool,
}

/// Outcome of recording one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub admitted: bool,
    /// Hits inside the window, including this one when admitted.
    pub count: u32,
    /// Timestamp of the oldest hit still inside the window.
    pub oldest_ms: Option<u64>,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Record a hit for `key` at `now_ms` unless `limit` hits already fall in
    /// `(now_ms - window_ms, now_ms]`.
    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowState, RateLimitError>;

    /// Forget hits at or before `cutoff_ms`. Returns how many were dropped.
    async fn prune(&self, cutoff_ms: u64) -> Result<u64, RateLimitError>;
}

/// Process-local hit log.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    hits: DashMap<String, VecDeque<u64>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowState, RateLimitError> {
        let cutoff = now_ms.saturating_sub(window_ms);
        let mut log = self.hits.entry(key.to_string()).or_default();
        while log.front().is_some_and(|&at| at <= cutoff) {
            log.pop_front();
        }

        let admitted = log.len() < limit as usize;
        if admitted {
            log.push_back(now_ms);
        }
        Ok(WindowState {
            admitted,
            count: log.len() as u32,
            oldest_ms: log.front().copied(),
        })
    }

    async fn prune(&self, cutoff_ms: u64) -> Result<u64, RateLimitError> {
        let mut dropped = 0u64;
        self.hits.retain(|_, log| {
            while log.front().is_some_and(|&at| at <= cutoff_ms) {
                log.pop_front();
                dropped += 1;
            }
            !log.is_empty()
        });
        Ok(dropped)
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS rate_limit_hits (
        identity TEXT NOT NULL,
        hit_at   INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rate_limit_hits ON rate_limit_hits (identity, hit_at)",
];

/// Hit log shared through SQLite.
pub struct SqliteRateLimitStore {
    pool: SqlitePool,
}

impl SqliteRateLimitStore {
    pub async fn connect(pool: SqlitePool) -> Result<Self, RateLimitError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowState, RateLimitError> {
        let cutoff = now_ms.saturating_sub(window_ms) as i64;
        let mut tx = self.pool.begin().await?;

        // Starting with a write takes the database write lock, so the count
        // and insert below cannot interleave with another instance.
        sqlx::query("DELETE FROM rate_limit_hits WHERE identity = ? AND hit_at <= ?")
            .bind(key)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        let (count, oldest): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(hit_at) FROM rate_limit_hits WHERE identity = ?",
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let admitted = count < i64::from(limit);
        if admitted {
            sqlx::query("INSERT INTO rate_limit_hits (identity, hit_at) VALUES (?, ?)")
                .bind(key)
                .bind(now_ms as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        let count = if admitted { count + 1 } else { count };
        Ok(WindowState {
            admitted,
            count: count as u32,
            oldest_ms: oldest.or(admitted.then_some(now_ms as i64)).map(|t| t as u64),
        })
    }

    async fn prune(&self, cutoff_ms: u64) -> Result<u64, RateLimitError> {
        let result = sqlx::query("DELETE FROM rate_limit_hits WHERE hit_at <= ?")
            .bind(cutoff_ms as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until a rejected client may retry.
    pub retry_after_secs: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    window: Duration,
    max_requests: u32,
    enabled: bool,
    path_prefix: String,
}

impl RateLimiter {
    pub async fn from_config(
        config: &RateLimitConfig,
        pool: Option<SqlitePool>,
    ) -> Result<Self, RateLimitError> {
        let store: Arc<dyn RateLimitStore> = match config.backend {
            RateLimitBackend::Sqlite if config.enabled => {
                let pool = pool.ok_or(RateLimitError::MissingPool)?;
                Arc::new(SqliteRateLimitStore::connect(pool).await?)
            }
            _ => Arc::new(MemoryRateLimitStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: &RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            window: config.window(),
            max_requests: config.max_requests,
            enabled: config.enabled,
            path_prefix: config.path_prefix.clone(),
        }
    }

    /// Whether requests to `path` count against the limit.
    pub fn applies_to(&self, path: &str) -> bool {
        self.enabled && path.starts_with(&self.path_prefix)
    }

    pub async fn check(&self, identity: &str) -> Result<Admission, RateLimitError> {
        self.check_at(identity, unix_millis()).await
    }

    pub async fn check_at(&self, identity: &str, now_ms: u64) -> Result<Admission, RateLimitError> {
        let window_ms = self.window.as_millis() as u64;
        let state = self
            .store
            .hit(identity, now_ms, window_ms, self.max_requests)
            .await?;

        let retry_after_secs = if state.admitted {
            0
        } else {
            let frees_at = state.oldest_ms.unwrap_or(now_ms) + window_ms;
            frees_at.saturating_sub(now_ms).div_ceil(1000).max(1)
        };

        Ok(Admission {
            allowed: state.admitted,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(state.count),
            retry_after_secs,
        })
    }

    /// Drop hits that have left the window.
    pub async fn prune(&self) -> Result<u64, RateLimitError> {
        let cutoff = unix_millis().saturating_sub(self.window.as_millis() as u64);
        self.store.prune(cutoff).await
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
