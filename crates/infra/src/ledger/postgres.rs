//! Postgres-backed idempotency ledger.
//!
//! Claims map onto two conditional statements:
//!
//! 1. `INSERT ... ON CONFLICT (key) DO NOTHING RETURNING key`: a returned row
//!    means the claim is `New`.
//! 2. `UPDATE ... SET status = 'INFLIGHT', attempts = attempts + 1
//!    WHERE key = $1 AND status = 'FAILED' RETURNING attempts`: a returned row
//!    means `Retry`.
//!
//! If neither statement wins, the current row is read back to decide between
//! `DuplicateSucceeded` and `DuplicateInflight`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | LedgerError |
//! |------------|-------------|
//! | PoolClosed / Io / PoolTimedOut / Tls | `Unavailable` |
//! | Database (any code) | `Unavailable` |
//! | ColumnDecode / Decode | `Corrupt` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use ingestflow_core::{Clock, IdempotencyKey, MessageId, RequestId};

use super::{
    ClaimOutcome, ClaimRequest, IdempotencyLedger, IdempotencyRecord, LedgerError, RecordStatus,
};

/// DDL for the backing table. Applied by [`PostgresLedger::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_records (
    key             TEXT PRIMARY KEY,
    status          TEXT NOT NULL CHECK (status IN ('INFLIGHT', 'SUCCEEDED', 'FAILED')),
    checksum        TEXT NOT NULL,
    first_seen_at   TIMESTAMPTZ NOT NULL,
    processed_at    TIMESTAMPTZ,
    failed_at       TIMESTAMPTZ,
    attempts        INTEGER NOT NULL,
    expires_at      TIMESTAMPTZ NOT NULL,
    request_id      UUID NOT NULL,
    message_id      UUID NOT NULL,
    result          JSONB,
    error_message   TEXT
);
CREATE INDEX IF NOT EXISTS idempotency_records_expires_at_idx
    ON idempotency_records (expires_at);
"#;

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl PostgresLedger {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
            ttl,
        }
    }

    /// Connect and make sure the table exists.
    pub async fn connect(
        database_url: &str,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Result<Self, LedgerError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let ledger = Self::new(pool, clock, ttl);
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn status_of(&self, key: &IdempotencyKey) -> Result<Option<RecordStatus>, LedgerError> {
        let row = sqlx::query("SELECT status FROM idempotency_records WHERE key = $1")
            .bind(key.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("status_of", e))?;

        row.map(|r| {
            let status: String = r
                .try_get("status")
                .map_err(|e| map_sqlx_error("status_of", e))?;
            RecordStatus::parse(&status)
                .ok_or_else(|| LedgerError::Corrupt(format!("unknown status {status}")))
        })
        .transpose()
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresLedger {
    #[instrument(skip(self, request), fields(key = %request.key), err)]
    async fn claim(&self, request: ClaimRequest) -> Result<ClaimOutcome, LedgerError> {
        let now = self.clock.now();

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records
                (key, status, checksum, first_seen_at, attempts, expires_at, request_id, message_id)
            VALUES ($1, 'INFLIGHT', $2, $3, 1, $4, $5, $6)
            ON CONFLICT (key) DO NOTHING
            RETURNING key
            "#,
        )
        .bind(request.key.as_str())
        .bind(&request.checksum)
        .bind(now)
        .bind(now + self.ttl)
        .bind(request.request_id.as_uuid())
        .bind(request.message_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_insert", e))?;

        if inserted.is_some() {
            return Ok(ClaimOutcome::New);
        }

        let retried = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'INFLIGHT', attempts = attempts + 1, request_id = $2, message_id = $3
            WHERE key = $1 AND status = 'FAILED'
            RETURNING attempts
            "#,
        )
        .bind(request.key.as_str())
        .bind(request.request_id.as_uuid())
        .bind(request.message_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_retry", e))?;

        if let Some(row) = retried {
            let attempts: i32 = row
                .try_get("attempts")
                .map_err(|e| map_sqlx_error("claim_retry", e))?;
            return Ok(ClaimOutcome::Retry {
                attempts: attempts.max(0) as u32,
            });
        }

        match self.get(&request.key).await? {
            Some(record) if record.status == RecordStatus::Succeeded => {
                Ok(ClaimOutcome::DuplicateSucceeded(Box::new(record)))
            }
            // Either INFLIGHT, or purged between statements; both mean "not ours".
            _ => Ok(ClaimOutcome::DuplicateInflight),
        }
    }

    #[instrument(skip(self, result), fields(key = %key), err)]
    async fn complete(&self, key: &IdempotencyKey, result: JsonValue) -> Result<(), LedgerError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'SUCCEEDED', processed_at = $2, result = $3
            WHERE key = $1 AND status = 'INFLIGHT'
            "#,
        )
        .bind(key.as_str())
        .bind(self.clock.now())
        .bind(&result)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        match self.status_of(key).await? {
            None => Err(LedgerError::NotFound(key.clone())),
            Some(RecordStatus::Succeeded) => Ok(()),
            Some(from) => Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from,
                to: RecordStatus::Succeeded,
            }),
        }
    }

    #[instrument(skip(self, error_message), fields(key = %key), err)]
    async fn fail(&self, key: &IdempotencyKey, error_message: &str) -> Result<(), LedgerError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = 'FAILED', failed_at = $2, error_message = $3
            WHERE key = $1 AND status <> 'SUCCEEDED'
            "#,
        )
        .bind(key.as_str())
        .bind(self.clock.now())
        .bind(error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        match self.status_of(key).await? {
            None => Err(LedgerError::NotFound(key.clone())),
            Some(from) => Err(LedgerError::InvalidTransition {
                key: key.clone(),
                from,
                to: RecordStatus::Failed,
            }),
        }
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT key, status, checksum, first_seen_at, processed_at, failed_at, attempts,
                   expires_at, request_id, message_id, result, error_message
            FROM idempotency_records
            WHERE key = $1
            "#,
        )
        .bind(key.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, LedgerError> {
        let deleted = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;
        Ok(deleted.rows_affected() as usize)
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, LedgerError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_record", e);

    let key: String = row.try_get("key").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let request_id: uuid::Uuid = row.try_get("request_id").map_err(decode)?;
    let message_id: uuid::Uuid = row.try_get("message_id").map_err(decode)?;

    Ok(IdempotencyRecord {
        key: IdempotencyKey::new(key).map_err(|e| LedgerError::Corrupt(e.to_string()))?,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| LedgerError::Corrupt(format!("unknown status {status}")))?,
        checksum: row.try_get("checksum").map_err(decode)?,
        first_seen_at: row.try_get("first_seen_at").map_err(decode)?,
        processed_at: row.try_get("processed_at").map_err(decode)?,
        failed_at: row.try_get("failed_at").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        request_id: RequestId::from_uuid(request_id),
        message_id: MessageId::from_uuid(message_id),
        result: row.try_get("result").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            LedgerError::Corrupt(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            LedgerError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        other => LedgerError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}
