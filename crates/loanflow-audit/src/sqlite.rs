//! SQLite audit storage.
//!
//! The table is guarded by triggers that abort any `UPDATE` or `DELETE`, so
//! the write-once rule holds for every client of the database, not only for
//! this crate.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row};
use uuid::Uuid;

use crate::entry::AuditEntry;
use crate::error::AuditError;
use crate::logger::AuditFilter;
use crate::storage::AuditStorage;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS audit_entries (
        id        TEXT PRIMARY KEY NOT NULL,
        loan_id   TEXT,
        user_id   TEXT NOT NULL,
        agent     TEXT NOT NULL,
        action    TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        metadata  TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_entries_loan ON audit_entries (loan_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_entries_timestamp ON audit_entries (timestamp)",
    r#"
    CREATE TRIGGER IF NOT EXISTS audit_entries_no_update
    BEFORE UPDATE ON audit_entries
    BEGIN
        SELECT RAISE(ABORT, 'audit entries cannot be modified');
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS audit_entries_no_delete
    BEFORE DELETE ON audit_entries
    BEGIN
        SELECT RAISE(ABORT, 'audit entries cannot be deleted');
    END
    "#,
];

/// Audit entries in the `audit_entries` table.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Wrap `pool`, creating the table and guards if needed.
    pub async fn connect(pool: SqlitePool) -> Result<Self, AuditError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(|e| {
                AuditError::InitializationFailed(format!("audit schema setup failed: {e}"))
            })?;
        }
        Ok(Self { pool })
    }

    fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry, AuditError> {
        let id: String = row.try_get("id")?;
        let loan_id: Option<String> = row.try_get("loan_id")?;
        let timestamp: String = row.try_get("timestamp")?;
        let metadata: String = row.try_get("metadata")?;

        Ok(AuditEntry {
            id: parse_uuid(&id)?,
            loan_id: loan_id.as_deref().map(parse_uuid).transpose()?,
            actor_id: row.try_get("user_id")?,
            agent: row.try_get("agent")?,
            action: row.try_get("action")?,
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| AuditError::StorageError(format!("bad timestamp {timestamp:?}: {e}")))?
                .with_timezone(&Utc),
            metadata: serde_json::from_str(&metadata)?,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, AuditError> {
    Uuid::parse_str(raw).map_err(|e| AuditError::StorageError(format!("bad id {raw:?}: {e}")))
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// SQLite takes LIMIT and OFFSET as signed 64-bit values.
fn to_sql_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl AuditStorage for SqliteStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let metadata = serde_json::to_string(&entry.metadata)?;

        let result = sqlx::query(
            "INSERT INTO audit_entries (id, loan_id, user_id, agent, action, timestamp, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(entry.loan_id.map(|id| id.to_string()))
        .bind(&entry.actor_id)
        .bind(&entry.agent)
        .bind(&entry.action)
        .bind(format_timestamp(&entry.timestamp))
        .bind(metadata)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(AuditError::ImmutableEntry(entry.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, loan_id, user_id, agent, action, timestamp, metadata \
             FROM audit_entries WHERE 1 = 1",
        );

        if let Some(loan_id) = filter.loan_id {
            qb.push(" AND loan_id = ").push_bind(loan_id.to_string());
        }
        if let Some(ref actor) = filter.actor_id {
            qb.push(" AND user_id = ").push_bind(actor.clone());
        }
        if let Some(ref agent) = filter.agent {
            qb.push(" AND agent = ").push_bind(agent.clone());
        }
        if let Some(ref prefix) = filter.action_prefix {
            qb.push(" AND substr(action, 1, length(")
                .push_bind(prefix.clone())
                .push(")) = ")
                .push_bind(prefix.clone());
        }
        if let Some(start) = filter.start_time {
            qb.push(" AND timestamp >= ").push_bind(format_timestamp(&start));
        }
        if let Some(end) = filter.end_time {
            qb.push(" AND timestamp <= ").push_bind(format_timestamp(&end));
        }

        // rowid breaks ties between entries written in the same microsecond.
        qb.push(" ORDER BY timestamp DESC, rowid DESC LIMIT ")
            .push_bind(filter.limit.map(to_sql_count).unwrap_or(-1))
            .push(" OFFSET ")
            .push_bind(to_sql_count(filter.offset.unwrap_or(0)));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        let row = sqlx::query(
            "SELECT id, loan_id, user_id, agent, action, timestamp, metadata \
             FROM audit_entries WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }
}
