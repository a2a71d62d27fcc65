//! # Call Processor
//!
//! Per-call asynchronous worker. Triggered after every successful packet
//! persist, possibly many times concurrently for the same call, so the
//! first thing a worker does is take the call's row lock and check whether
//! the outcome is already owned. The winner claims the call by committing
//! the `PROCESSING_AI` transition, then drives the transcription client
//! through an exponential-backoff retry loop with every lock released.
//!
//! ## Lock Discipline:
//! Row locks are held only inside the short claim and terminal-write
//! transactions. The transcription call and the backoff sleeps run with no
//! lock and no pooled connection held.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::notifier::{CallUpdate, Notifier};
use crate::store::models::{AiResultPatch, AiStatus, CallState, TransitionError};
use crate::store::{CallStore, StoreError};
use crate::transcription::{Transcription, TranscriptionClient, TranscriptionError};

/// Worker failure. Either persistence gave out mid-flight or a lifecycle
/// advance was attempted outside the legal graph; both abort the worker
/// and leave the call recoverable in its committed state.
#[derive(Debug)]
pub enum ProcessError {
    Store(StoreError),
    Transition(TransitionError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Store(err) => write!(f, "{}", err),
            ProcessError::Transition(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        ProcessError::Store(err)
    }
}

impl From<TransitionError> for ProcessError {
    fn from(err: TransitionError) -> Self {
        ProcessError::Transition(err)
    }
}

/// Exponential backoff with jitter: `2^attempt + U(0, 1)` seconds.
/// Roughly 2, 4, 8, 16, 32 seconds for the default retry budget.
fn backoff_delay(attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen();
    Duration::from_secs_f64(2f64.powi(attempt as i32) + jitter)
}

/// Drives calls from ingested to transcribed-or-failed.
pub struct CallProcessor {
    store: Arc<dyn CallStore>,
    client: Arc<dyn TranscriptionClient>,
    notifier: Arc<Notifier>,
    config: Arc<RwLock<AppConfig>>,
}

impl CallProcessor {
    pub fn new(
        store: Arc<dyn CallStore>,
        client: Arc<dyn TranscriptionClient>,
        notifier: Arc<Notifier>,
        config: Arc<RwLock<AppConfig>>,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            config,
        }
    }

    fn max_retries(&self) -> u32 {
        self.config.read().unwrap().processing.max_ai_retries
    }

    /// Fire a detached worker for `call_id`. The caller does not await it;
    /// the returned handle exists so tests can.
    pub fn spawn(self: &Arc<Self>, call_id: &str) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = processor.run(&call_id).await {
                error!(call_id = %call_id, error = %err, "call processing worker aborted");
            }
        })
    }

    async fn run(&self, call_id: &str) -> Result<(), ProcessError> {
        if !self.claim(call_id).await? {
            return Ok(());
        }

        // Aggregated packet view, read outside any lock. Packets that land
        // after this read belong to a later trigger.
        let audio = self.store.fetch_packet_data(call_id).await?;

        let max_retries = self.max_retries();
        for attempt in 1..=max_retries + 1 {
            match self.client.transcribe(call_id, &audio).await {
                Ok(result) => {
                    self.complete(call_id, attempt, result).await?;
                    return Ok(());
                }
                Err(err) if attempt <= max_retries => {
                    self.record_failed_attempt(call_id, attempt, &err).await?;
                    let delay = backoff_delay(attempt);
                    info!(
                        call_id = %call_id,
                        attempt,
                        max_retries,
                        delay_secs = format!("{:.2}", delay.as_secs_f64()).as_str(),
                        "transcription attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.fail(call_id, attempt, &err).await?;
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Idempotence guard and claim. Under the row lock, decide whether this
    /// worker owns the call: `PROCESSING_AI`, `COMPLETED` and `ARCHIVED`
    /// are already spoken for. Returns `true` when the `PROCESSING_AI`
    /// transition was committed by this worker.
    async fn claim(&self, call_id: &str) -> Result<bool, ProcessError> {
        let mut tx = self.store.begin().await?;
        let call = match tx.get_call_for_update(call_id).await? {
            Some(call) => call,
            None => {
                warn!(call_id = %call_id, "processing triggered for unknown call");
                tx.rollback().await?;
                return Ok(false);
            }
        };

        match call.state {
            CallState::ProcessingAi | CallState::Completed | CallState::Archived => {
                debug!(
                    call_id = %call_id,
                    state = %call.state,
                    "call already owned or settled, skipping"
                );
                tx.rollback().await?;
                Ok(false)
            }
            current => {
                let next = current.transition(CallState::ProcessingAi)?;
                tx.update_call(call_id, Some(next), None).await?;
                tx.upsert_ai_result(
                    call_id,
                    AiResultPatch {
                        status: Some(AiStatus::Processing),
                        ..Default::default()
                    },
                )
                .await?;
                tx.commit().await?;

                self.publish(call_id, CallState::ProcessingAi, false).await;
                Ok(true)
            }
        }
    }

    async fn complete(
        &self,
        call_id: &str,
        attempt: u32,
        result: Transcription,
    ) -> Result<(), ProcessError> {
        let mut tx = self.store.begin().await?;
        let call = tx
            .get_call_for_update(call_id)
            .await?
            .ok_or_else(|| StoreError::Backend(format!("call '{}' vanished", call_id)))?;
        let next = call.state.transition(CallState::Completed)?;
        tx.update_call(call_id, Some(next), None).await?;
        tx.upsert_ai_result(
            call_id,
            AiResultPatch {
                status: Some(AiStatus::Completed),
                transcript: Some(result.transcript),
                sentiment: Some(result.sentiment),
                retry_count: Some(attempt as i64),
                completed_at: Some(Utc::now()),
                error_message: Some(None),
                ..Default::default()
            },
        )
        .await?;
        tx.commit().await?;

        info!(call_id = %call_id, attempt, "call completed");
        self.publish(call_id, CallState::Completed, true).await;
        Ok(())
    }

    /// Retry bookkeeping between attempts. The call stays in
    /// `PROCESSING_AI`; only the AI result row is touched, and this worker
    /// is its only writer, so no row lock is needed.
    async fn record_failed_attempt(
        &self,
        call_id: &str,
        attempt: u32,
        err: &TranscriptionError,
    ) -> Result<(), ProcessError> {
        let mut tx = self.store.begin().await?;
        tx.upsert_ai_result(
            call_id,
            AiResultPatch {
                retry_count: Some(attempt as i64),
                last_retry_at: Some(Utc::now()),
                error_message: Some(Some(err.to_string())),
                ..Default::default()
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail(
        &self,
        call_id: &str,
        attempt: u32,
        err: &TranscriptionError,
    ) -> Result<(), ProcessError> {
        let mut tx = self.store.begin().await?;
        let call = tx
            .get_call_for_update(call_id)
            .await?
            .ok_or_else(|| StoreError::Backend(format!("call '{}' vanished", call_id)))?;
        let next = call.state.transition(CallState::Failed)?;
        tx.update_call(call_id, Some(next), None).await?;
        tx.upsert_ai_result(
            call_id,
            AiResultPatch {
                status: Some(AiStatus::Failed),
                retry_count: Some(attempt as i64),
                last_retry_at: Some(Utc::now()),
                error_message: Some(Some(err.to_string())),
                ..Default::default()
            },
        )
        .await?;
        tx.commit().await?;

        warn!(call_id = %call_id, attempt, "retry budget exhausted, call failed");
        self.publish(call_id, CallState::Failed, true).await;
        Ok(())
    }

    /// Emit a state-change event. Only called after the transition
    /// committed; delivery problems are the notifier's to absorb.
    async fn publish(&self, call_id: &str, state: CallState, with_ai_result: bool) {
        let ai_result = if with_ai_result {
            match self.store.get_call_snapshot(call_id).await {
                Ok(snapshot) => snapshot.and_then(|s| s.ai_result),
                Err(err) => {
                    warn!(
                        call_id = %call_id,
                        error = %err,
                        "could not attach ai result snapshot to event"
                    );
                    None
                }
            }
        } else {
            None
        };

        self.notifier.publish(&CallUpdate {
            call_id: call_id.to_string(),
            state,
            timestamp: Utc::now(),
            ai_result,
        });
    }
}
