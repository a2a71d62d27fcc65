//! # In-Memory Call Store
//!
//! Test-only adapter for the [`CallStore`] port. The database's
//! row-exclusive lock is emulated with one async mutex per call row; the
//! transaction holds the guard from `get_call_for_update` until commit or
//! rollback, which reproduces the blocking behavior the race tests depend
//! on. Writes land eagerly; every rollback path in the calling code happens
//! before a successful write, so no undo log is kept.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::models::{AiResultPatch, AiStatus, Call, CallAiResult, CallSnapshot, CallState};
use super::{CallStore, CallTx, StoreError};

#[derive(Debug, Clone)]
#[allow(dead_code)]
struct StoredPacket {
    data: String,
    timestamp: f64,
    received_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    calls: HashMap<String, Call>,
    /// call_id -> sequence -> packet; the BTreeMap keeps sequence order.
    packets: HashMap<String, BTreeMap<i64, StoredPacket>>,
    ai_results: HashMap<String, CallAiResult>,
}

struct Inner {
    data: StdMutex<Tables>,
    row_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// In-memory store shared by cloning.
#[derive(Clone)]
pub struct MemoryCallStore {
    inner: Arc<Inner>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: StdMutex::new(Tables::default()),
                row_locks: StdMutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for MemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryTx {
    inner: Arc<Inner>,
    /// Held from the first locked read until commit/rollback drops it.
    _row_guard: Option<OwnedMutexGuard<()>>,
    locked_call: Option<String>,
}

#[async_trait]
impl CallTx for MemoryTx {
    async fn get_call_for_update(&mut self, call_id: &str) -> Result<Option<Call>, StoreError> {
        // Absent rows take no lock; calls are never deleted, so a row seen
        // here stays for the lifetime of the process.
        let row_lock = {
            let data = self.inner.data.lock().unwrap();
            if !data.calls.contains_key(call_id) {
                return Ok(None);
            }
            let mut locks = self.inner.row_locks.lock().unwrap();
            locks
                .entry(call_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        if self.locked_call.as_deref() != Some(call_id) {
            let guard = row_lock.lock_owned().await;
            self._row_guard = Some(guard);
            self.locked_call = Some(call_id.to_string());
        }

        // Re-read after the lock: a concurrent transaction may have
        // committed while this one was blocked.
        let data = self.inner.data.lock().unwrap();
        Ok(data.calls.get(call_id).cloned())
    }

    async fn create_call(
        &mut self,
        call_id: &str,
        initial_state: CallState,
    ) -> Result<Call, StoreError> {
        let mut data = self.inner.data.lock().unwrap();
        if data.calls.contains_key(call_id) {
            return Err(StoreError::CallAlreadyExists(call_id.to_string()));
        }
        let now = Utc::now();
        let call = Call {
            call_id: call_id.to_string(),
            state: initial_state,
            last_sequence: -1,
            created_at: now,
            updated_at: now,
        };
        data.calls.insert(call_id.to_string(), call.clone());
        Ok(call)
    }

    async fn insert_packet(
        &mut self,
        call_id: &str,
        sequence: i64,
        data: &str,
        timestamp: f64,
    ) -> Result<(), StoreError> {
        let mut tables = self.inner.data.lock().unwrap();
        let per_call = tables.packets.entry(call_id.to_string()).or_default();
        if per_call.contains_key(&sequence) {
            return Err(StoreError::DuplicatePacket {
                call_id: call_id.to_string(),
                sequence,
            });
        }
        per_call.insert(
            sequence,
            StoredPacket {
                data: data.to_string(),
                timestamp,
                received_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn update_call(
        &mut self,
        call_id: &str,
        new_state: Option<CallState>,
        last_sequence: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut data = self.inner.data.lock().unwrap();
        let call = data
            .calls
            .get_mut(call_id)
            .ok_or_else(|| StoreError::Backend(format!("update_call: call '{}' not found", call_id)))?;
        if let Some(state) = new_state {
            call.state = state;
        }
        if let Some(seq) = last_sequence {
            call.last_sequence = seq;
        }
        call.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_ai_result(
        &mut self,
        call_id: &str,
        patch: AiResultPatch,
    ) -> Result<(), StoreError> {
        let mut data = self.inner.data.lock().unwrap();
        let entry = data
            .ai_results
            .entry(call_id.to_string())
            .or_insert_with(|| CallAiResult {
                call_id: call_id.to_string(),
                transcript: None,
                sentiment: None,
                status: AiStatus::Processing,
                retry_count: 0,
                last_retry_at: None,
                completed_at: None,
                error_message: None,
            });
        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(transcript) = patch.transcript {
            entry.transcript = Some(transcript);
        }
        if let Some(sentiment) = patch.sentiment {
            entry.sentiment = Some(sentiment);
        }
        if let Some(retry_count) = patch.retry_count {
            entry.retry_count = retry_count;
        }
        if let Some(at) = patch.last_retry_at {
            entry.last_retry_at = Some(at);
        }
        if let Some(at) = patch.completed_at {
            entry.completed_at = Some(at);
        }
        if let Some(error_message) = patch.error_message {
            entry.error_message = error_message;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        // Dropping the guard releases the row lock.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn begin(&self) -> Result<Box<dyn CallTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            _row_guard: None,
            locked_call: None,
        }))
    }

    async fn get_call_snapshot(&self, call_id: &str) -> Result<Option<CallSnapshot>, StoreError> {
        let data = self.inner.data.lock().unwrap();
        let call = match data.calls.get(call_id) {
            Some(call) => call.clone(),
            None => return Ok(None),
        };
        let packet_count = data.packets.get(call_id).map_or(0, |p| p.len() as i64);
        let ai_result = data.ai_results.get(call_id).cloned();
        Ok(Some(CallSnapshot {
            call,
            packet_count,
            ai_result,
        }))
    }

    async fn fetch_packet_data(&self, call_id: &str) -> Result<String, StoreError> {
        let data = self.inner.data.lock().unwrap();
        Ok(data
            .packets
            .get(call_id)
            .map(|per_call| {
                per_call
                    .values()
                    .map(|p| p.data.as_str())
                    .collect::<String>()
            })
            .unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn store_with_call(call_id: &str) -> MemoryCallStore {
        let store = MemoryCallStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.create_call(call_id, CallState::InProgress).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_call_twice_is_classified() {
        let store = store_with_call("c1").await;
        let mut tx = store.begin().await.unwrap();
        let err = tx.create_call("c1", CallState::InProgress).await.unwrap_err();
        assert!(matches!(err, StoreError::CallAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_duplicate_packet_is_classified() {
        let store = store_with_call("c1").await;
        let mut tx = store.begin().await.unwrap();
        tx.get_call_for_update("c1").await.unwrap();
        tx.insert_packet("c1", 0, "x", 1.0).await.unwrap();
        let err = tx.insert_packet("c1", 0, "y", 2.0).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePacket { sequence: 0, .. }));
        tx.commit().await.unwrap();

        let snap = store.get_call_snapshot("c1").await.unwrap().unwrap();
        assert_eq!(snap.packet_count, 1);
        assert_eq!(store.fetch_packet_data("c1").await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_packet_data_concatenates_in_sequence_order() {
        let store = store_with_call("c1").await;
        let mut tx = store.begin().await.unwrap();
        tx.get_call_for_update("c1").await.unwrap();
        tx.insert_packet("c1", 2, "c", 3.0).await.unwrap();
        tx.insert_packet("c1", 0, "a", 1.0).await.unwrap();
        tx.insert_packet("c1", 1, "b", 2.0).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.fetch_packet_data("c1").await.unwrap(), "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_lock_serializes_same_call_transactions() {
        let store = store_with_call("c1").await;

        let mut tx1 = store.begin().await.unwrap();
        tx1.get_call_for_update("c1").await.unwrap();

        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
        let store2 = store.clone();
        let second = tokio::spawn(async move {
            let mut tx2 = store2.begin().await.unwrap();
            // Blocks until tx1 releases the row lock.
            let call = tx2.get_call_for_update("c1").await.unwrap().unwrap();
            tx2.update_call("c1", None, Some(call.last_sequence.max(7)))
                .await
                .unwrap();
            tx2.commit().await.unwrap();
            let _ = done_tx.send(());
        });

        // The second transaction must still be parked behind the lock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(done_rx.try_recv().is_err());

        tx1.update_call("c1", None, Some(3)).await.unwrap();
        tx1.commit().await.unwrap();

        second.await.unwrap();
        let snap = store.get_call_snapshot("c1").await.unwrap().unwrap();
        // tx2 observed tx1's write and then applied its own on top.
        assert_eq!(snap.call.last_sequence, 7);
    }

    #[tokio::test]
    async fn test_lock_released_when_tx_dropped_without_commit() {
        let store = store_with_call("c1").await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.get_call_for_update("c1").await.unwrap();
            // Dropped here without commit or rollback.
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_call_for_update("c1").await.unwrap().is_some());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_ai_result_partial_patches() {
        let store = store_with_call("c1").await;
        let mut tx = store.begin().await.unwrap();
        tx.upsert_ai_result(
            "c1",
            AiResultPatch {
                status: Some(AiStatus::Processing),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.upsert_ai_result(
            "c1",
            AiResultPatch {
                retry_count: Some(2),
                error_message: Some(Some("boom".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let snap = store.get_call_snapshot("c1").await.unwrap().unwrap();
        let ai = snap.ai_result.unwrap();
        assert_eq!(ai.status, AiStatus::Processing);
        assert_eq!(ai.retry_count, 2);
        assert_eq!(ai.error_message.as_deref(), Some("boom"));

        // A completing patch clears the stale error.
        let mut tx = store.begin().await.unwrap();
        tx.upsert_ai_result(
            "c1",
            AiResultPatch {
                status: Some(AiStatus::Completed),
                transcript: Some("hello".to_string()),
                error_message: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let ai = store
            .get_call_snapshot("c1")
            .await
            .unwrap()
            .unwrap()
            .ai_result
            .unwrap();
        assert_eq!(ai.status, AiStatus::Completed);
        assert_eq!(ai.transcript.as_deref(), Some("hello"));
        assert!(ai.error_message.is_none());
    }
}
