//! SQLite-backed loan store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use loanflow_core::{LoanApplication, RiskLevel, Stage};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::store::{LoanStore, StoreError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS loans (
        id         TEXT PRIMARY KEY NOT NULL,
        owner_id   TEXT NOT NULL,
        stage      TEXT NOT NULL,
        data       TEXT NOT NULL DEFAULT '{}',
        risk_level TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version    INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_loans_owner ON loans (owner_id, created_at)",
];

const COLUMNS: &str = "id, owner_id, stage, data, risk_level, created_at, updated_at, version";

pub struct SqliteLoanStore {
    pool: SqlitePool,
}

impl SqliteLoanStore {
    /// Wrap `pool`, creating the `loans` table if needed.
    pub async fn connect(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    fn row_to_loan(row: &SqliteRow) -> Result<LoanApplication, StoreError> {
        let id: String = row.try_get("id")?;
        let stage: String = row.try_get("stage")?;
        let data: String = row.try_get("data")?;
        let risk_level: Option<String> = row.try_get("risk_level")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let version: i64 = row.try_get("version")?;

        Ok(LoanApplication {
            id: Uuid::parse_str(&id)
                .map_err(|e| StoreError::Backend(format!("bad loan id {id:?}: {e}")))?,
            owner_id: row.try_get("owner_id")?,
            stage: stage
                .parse::<Stage>()
                .map_err(|e| StoreError::Backend(e.to_string()))?,
            data: serde_json::from_str(&data)?,
            risk_level: risk_level
                .map(|r| r.parse::<RiskLevel>().map_err(StoreError::Backend))
                .transpose()?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            version: version as u64,
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {raw:?}: {e}")))
}

#[async_trait]
impl LoanStore for SqliteLoanStore {
    async fn insert(&self, loan: &LoanApplication) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO loans ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(loan.id.to_string())
        .bind(&loan.owner_id)
        .bind(loan.stage.as_str())
        .bind(serde_json::to_string(&loan.data)?)
        .bind(loan.risk_level.map(|r| r.as_str()))
        .bind(format_timestamp(&loan.created_at))
        .bind(format_timestamp(&loan.updated_at))
        .bind(loan.version as i64)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(loan.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<LoanApplication>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM loans WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_loan).transpose()
    }

    async fn save(&self, loan: &LoanApplication) -> Result<LoanApplication, StoreError> {
        let result = sqlx::query(
            "UPDATE loans SET stage = ?, data = ?, risk_level = ?, updated_at = ?, \
             version = version + 1 WHERE id = ? AND version = ?",
        )
        .bind(loan.stage.as_str())
        .bind(serde_json::to_string(&loan.data)?)
        .bind(loan.risk_level.map(|r| r.as_str()))
        .bind(format_timestamp(&loan.updated_at))
        .bind(loan.id.to_string())
        .bind(loan.version as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get(loan.id).await? {
                Some(_) => Err(StoreError::Conflict {
                    id: loan.id,
                    expected: loan.version,
                }),
                None => Err(StoreError::NotFound(loan.id)),
            };
        }

        let mut saved = loan.clone();
        saved.version += 1;
        Ok(saved)
    }

    async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<LoanApplication>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM loans WHERE owner_id = ? ORDER BY created_at DESC, rowid DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_loan).collect()
    }

    async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}
