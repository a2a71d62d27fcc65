//! # Postgres Call Store
//!
//! Postgres adapter for the [`CallStore`] port. All SQL is runtime-checked
//! (`sqlx::query`, not `sqlx::query!`) to avoid a compile-time database
//! requirement. Per-call serialization rides on `SELECT ... FOR UPDATE`;
//! the lock is held by the enclosing transaction and released at commit or
//! rollback.
//!
//! Unique-constraint violations are classified into the two expected
//! outcomes (`CallAlreadyExists`, `DuplicatePacket`); everything else maps
//! to `StoreError::Backend`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::{PgPool, Postgres, Transaction};

use super::models::{AiResultPatch, Call, CallAiResult, CallSnapshot, CallState};
use super::{CallStore, CallTx, StoreError};

/// Schema for the three call-processing tables. Applied at startup;
/// idempotent. The unique constraint on `(call_id, sequence)` is what makes
/// duplicate packet submission a safe no-op.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS calls (
    call_id        TEXT PRIMARY KEY,
    state          TEXT NOT NULL DEFAULT 'IN_PROGRESS',
    last_sequence  BIGINT NOT NULL DEFAULT -1,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at     TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS call_packets (
    id           BIGSERIAL PRIMARY KEY,
    call_id      TEXT NOT NULL REFERENCES calls(call_id) ON DELETE CASCADE,
    sequence     BIGINT NOT NULL,
    data         TEXT NOT NULL,
    timestamp    DOUBLE PRECISION NOT NULL,
    received_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT uq_call_sequence UNIQUE (call_id, sequence)
);

CREATE TABLE IF NOT EXISTS call_ai_results (
    call_id        TEXT PRIMARY KEY REFERENCES calls(call_id) ON DELETE CASCADE,
    transcript     TEXT,
    sentiment      TEXT,
    status         TEXT NOT NULL DEFAULT 'processing',
    retry_count    BIGINT NOT NULL DEFAULT 0,
    last_retry_at  TIMESTAMPTZ,
    completed_at   TIMESTAMPTZ,
    error_message  TEXT
);
"#;

type CallRow = (String, String, i64, DateTime<Utc>, DateTime<Utc>);
type AiResultRow = (
    String,
    Option<String>,
    Option<String>,
    String,
    i64,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<String>,
);

/// Postgres-backed call store wrapping a connection pool.
pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the call-processing tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

fn parse_call_row(row: CallRow) -> Result<Call, StoreError> {
    let (call_id, state, last_sequence, created_at, updated_at) = row;
    let state = state.parse::<CallState>().map_err(StoreError::Backend)?;
    Ok(Call {
        call_id,
        state,
        last_sequence,
        created_at,
        updated_at,
    })
}

fn parse_ai_result_row(row: AiResultRow) -> Result<CallAiResult, StoreError> {
    let (call_id, transcript, sentiment, status, retry_count, last_retry_at, completed_at, error_message) =
        row;
    let status = status.parse().map_err(StoreError::Backend)?;
    Ok(CallAiResult {
        call_id,
        transcript,
        sentiment,
        status,
        retry_count,
        last_retry_at,
        completed_at,
        error_message,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), ErrorKind::UniqueViolation)
    )
}

/// One open Postgres transaction. Holds any row lock acquired through
/// `get_call_for_update` until committed or rolled back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CallTx for PgTx {
    async fn get_call_for_update(&mut self, call_id: &str) -> Result<Option<Call>, StoreError> {
        let row = sqlx::query_as::<_, CallRow>(
            r#"
            SELECT call_id, state, last_sequence, created_at, updated_at
            FROM calls
            WHERE call_id = $1
            FOR UPDATE
            "#,
        )
        .bind(call_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(parse_call_row).transpose()
    }

    async fn create_call(
        &mut self,
        call_id: &str,
        initial_state: CallState,
    ) -> Result<Call, StoreError> {
        let row = sqlx::query_as::<_, CallRow>(
            r#"
            INSERT INTO calls (call_id, state, last_sequence)
            VALUES ($1, $2, -1)
            RETURNING call_id, state, last_sequence, created_at, updated_at
            "#,
        )
        .bind(call_id)
        .bind(initial_state.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::CallAlreadyExists(call_id.to_string())
            } else {
                err.into()
            }
        })?;

        parse_call_row(row)
    }

    async fn insert_packet(
        &mut self,
        call_id: &str,
        sequence: i64,
        data: &str,
        timestamp: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO call_packets (call_id, sequence, data, timestamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(call_id)
        .bind(sequence)
        .bind(data)
        .bind(timestamp)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::DuplicatePacket {
                    call_id: call_id.to_string(),
                    sequence,
                }
            } else {
                StoreError::from(err)
            }
        })?;

        Ok(())
    }

    async fn update_call(
        &mut self,
        call_id: &str,
        new_state: Option<CallState>,
        last_sequence: Option<i64>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE calls
            SET state = COALESCE($2, state),
                last_sequence = COALESCE($3, last_sequence),
                updated_at = now()
            WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .bind(new_state.map(|s| s.as_str()))
        .bind(last_sequence)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!(
                "update_call: call '{}' not found",
                call_id
            )));
        }
        Ok(())
    }

    async fn upsert_ai_result(
        &mut self,
        call_id: &str,
        patch: AiResultPatch,
    ) -> Result<(), StoreError> {
        // $9 marks whether the patch touches error_message at all; when it
        // does, $8 carries the new value (possibly NULL, clearing it).
        let error_value = patch.error_message.clone().flatten();
        let touch_error = patch.error_message.is_some();

        sqlx::query(
            r#"
            INSERT INTO call_ai_results
                (call_id, status, transcript, sentiment, retry_count,
                 last_retry_at, completed_at, error_message)
            VALUES ($1, COALESCE($2, 'processing'), $3, $4, COALESCE($5, 0), $6, $7, $8)
            ON CONFLICT (call_id) DO UPDATE SET
                status = COALESCE($2, call_ai_results.status),
                transcript = COALESCE($3, call_ai_results.transcript),
                sentiment = COALESCE($4, call_ai_results.sentiment),
                retry_count = COALESCE($5, call_ai_results.retry_count),
                last_retry_at = COALESCE($6, call_ai_results.last_retry_at),
                completed_at = COALESCE($7, call_ai_results.completed_at),
                error_message = CASE WHEN $9 THEN $8 ELSE call_ai_results.error_message END
            "#,
        )
        .bind(call_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.transcript)
        .bind(patch.sentiment)
        .bind(patch.retry_count)
        .bind(patch.last_retry_at)
        .bind(patch.completed_at)
        .bind(error_value)
        .bind(touch_error)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn begin(&self) -> Result<Box<dyn CallTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn get_call_snapshot(&self, call_id: &str) -> Result<Option<CallSnapshot>, StoreError> {
        let row = sqlx::query_as::<_, CallRow>(
            r#"
            SELECT call_id, state, last_sequence, created_at, updated_at
            FROM calls
            WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        let call = match row {
            Some(row) => parse_call_row(row)?,
            None => return Ok(None),
        };

        let packet_count = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM call_packets WHERE call_id = $1"#,
        )
        .bind(call_id)
        .fetch_one(&self.pool)
        .await?;

        let ai_result = sqlx::query_as::<_, AiResultRow>(
            r#"
            SELECT call_id, transcript, sentiment, status, retry_count,
                   last_retry_at, completed_at, error_message
            FROM call_ai_results
            WHERE call_id = $1
            "#,
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?
        .map(parse_ai_result_row)
        .transpose()?;

        Ok(Some(CallSnapshot {
            call,
            packet_count,
            ai_result,
        }))
    }

    async fn fetch_packet_data(&self, call_id: &str) -> Result<String, StoreError> {
        let chunks = sqlx::query_scalar::<_, String>(
            r#"
            SELECT data FROM call_packets
            WHERE call_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(call_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(chunks.concat())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
