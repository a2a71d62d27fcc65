//! # Persistence Layer
//!
//! Port traits for transactional call storage, with a Postgres adapter for
//! production and an in-memory adapter for the test suite.
//!
//! ## Locking Contract:
//! Per-call serialization is delegated entirely to the storage layer's
//! row-exclusive lock, acquired through [`CallTx::get_call_for_update`] and
//! released when the transaction commits or rolls back. Callers never hold
//! a lock across external I/O or a sleep, and no in-process per-call lock
//! exists on top of this one.

pub mod models;
pub mod postgres;

#[cfg(test)]
pub mod memory;

use std::fmt;

use async_trait::async_trait;

use models::{AiResultPatch, Call, CallSnapshot, CallState};

/// Errors surfaced by the storage layer.
///
/// `CallAlreadyExists` and `DuplicatePacket` are expected outcomes the
/// ingestion path handles explicitly; `Backend` is everything else and
/// surfaces to callers as a server error.
#[derive(Debug)]
pub enum StoreError {
    /// Insert raced with another first-packet submission; the caller must
    /// retry the locked-read path.
    CallAlreadyExists(String),

    /// A packet with this `(call_id, sequence)` pair is already persisted.
    DuplicatePacket { call_id: String, sequence: i64 },

    /// Unexpected database failure (connection loss, constraint violations
    /// not classified above).
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::CallAlreadyExists(call_id) => {
                write!(f, "call '{}' already exists", call_id)
            }
            StoreError::DuplicatePacket { call_id, sequence } => {
                write!(
                    f,
                    "packet (call '{}', sequence {}) already persisted",
                    call_id, sequence
                )
            }
            StoreError::Backend(msg) => write!(f, "database error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// An open transaction against the call store.
///
/// The row lock taken by [`get_call_for_update`](CallTx::get_call_for_update)
/// lives until [`commit`](CallTx::commit) or [`rollback`](CallTx::rollback).
/// Dropping the transaction without either is equivalent to a rollback.
#[async_trait]
pub trait CallTx: Send {
    /// Read the call row under an exclusive row lock, or signal absence.
    /// Blocks concurrent transactions for the same `call_id` only.
    async fn get_call_for_update(&mut self, call_id: &str) -> Result<Option<Call>, StoreError>;

    /// Insert a new call row in `initial_state`.
    async fn create_call(
        &mut self,
        call_id: &str,
        initial_state: CallState,
    ) -> Result<Call, StoreError>;

    /// Insert one packet. Uniqueness over `(call_id, sequence)` is enforced
    /// by the storage layer, not checked here first.
    async fn insert_packet(
        &mut self,
        call_id: &str,
        sequence: i64,
        data: &str,
        timestamp: f64,
    ) -> Result<(), StoreError>;

    /// Atomic partial update of a call row. Bumps `updated_at`.
    async fn update_call(
        &mut self,
        call_id: &str,
        new_state: Option<CallState>,
        last_sequence: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Create-or-update the AI result row for a call.
    async fn upsert_ai_result(
        &mut self,
        call_id: &str,
        patch: AiResultPatch,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Handle to the call store. Stateless beyond the connection pool it owns.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn CallTx>, StoreError>;

    /// Read-only aggregate for status queries. No locks taken.
    async fn get_call_snapshot(&self, call_id: &str) -> Result<Option<CallSnapshot>, StoreError>;

    /// Aggregated packet view handed to the transcription client: packet
    /// `data` concatenated in sequence order.
    async fn fetch_packet_data(&self, call_id: &str) -> Result<String, StoreError>;

    /// Connectivity probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
