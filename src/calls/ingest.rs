//! # Ingestion Coordinator
//!
//! Per-packet entry point. Under the call's row-exclusive lock it ensures
//! the call row exists, absorbs duplicates, persists the packet together
//! with the `last_sequence` advance, commits, and only then fires the
//! processor as a detached task. Nothing on this path waits for
//! transcription work; the acknowledgment is returned as soon as the packet
//! is durable.
//!
//! ## First-Packet Race:
//! Two concurrent submissions for an unseen call both observe an absent
//! row. Each tries to create it in its own short transaction; exactly one
//! wins, the loser sees `CallAlreadyExists` and restarts on the locked-read
//! path, now finding the row.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::store::models::CallState;
use crate::store::{CallStore, StoreError};

use super::processor::CallProcessor;

/// Sequence anomaly observed during ingestion. Warned about, never fatal:
/// missing packets must not block the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceAnomaly {
    /// The packet skipped ahead of the expected next sequence.
    Gap { expected: i64 },
    /// The packet arrived with a sequence at or below one already seen.
    Reorder { expected: i64 },
}

impl SequenceAnomaly {
    fn kind(&self) -> &'static str {
        match self {
            SequenceAnomaly::Gap { .. } => "gap",
            SequenceAnomaly::Reorder { .. } => "reorder",
        }
    }

    fn expected(&self) -> i64 {
        match self {
            SequenceAnomaly::Gap { expected } | SequenceAnomaly::Reorder { expected } => *expected,
        }
    }
}

/// Acceptance acknowledgment for one packet submission.
#[derive(Debug, Clone)]
pub struct IngestAck {
    pub call_id: String,
    pub sequence: i64,
    /// The `(call_id, sequence)` pair was already persisted; the submission
    /// was absorbed and no processing was triggered.
    pub duplicate: bool,
    pub anomaly: Option<SequenceAnomaly>,
}

impl IngestAck {
    /// Informational note for the acknowledgment body, when there is one.
    pub fn message(&self) -> Option<String> {
        if self.duplicate {
            return Some(format!(
                "duplicate packet (sequence {}) silently accepted",
                self.sequence
            ));
        }
        self.anomaly.map(|anomaly| {
            format!(
                "packet accepted but sequence mismatch (expected {})",
                anomaly.expected()
            )
        })
    }
}

/// Admits packets and triggers processing.
pub struct IngestionCoordinator {
    store: Arc<dyn CallStore>,
    processor: Arc<CallProcessor>,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn CallStore>, processor: Arc<CallProcessor>) -> Self {
        Self { store, processor }
    }

    /// Durably accept one packet. Returns once the packet (or the decision
    /// to absorb it as a duplicate) is committed; the processor trigger is
    /// detached and never awaited.
    pub async fn ingest(
        &self,
        call_id: &str,
        sequence: i64,
        data: &str,
        timestamp: f64,
    ) -> Result<IngestAck, StoreError> {
        let ack = self.persist(call_id, sequence, data, timestamp).await?;

        if !ack.duplicate {
            let _detached = self.processor.spawn(call_id);
        }

        Ok(ack)
    }

    async fn persist(
        &self,
        call_id: &str,
        sequence: i64,
        data: &str,
        timestamp: f64,
    ) -> Result<IngestAck, StoreError> {
        loop {
            let mut tx = self.store.begin().await?;

            let call = match tx.get_call_for_update(call_id).await? {
                Some(call) => call,
                None => {
                    // Release the (lockless) read transaction before the
                    // create attempt so the loser of the race holds nothing
                    // while it restarts.
                    tx.commit().await?;
                    let mut create_tx = self.store.begin().await?;
                    match create_tx.create_call(call_id, CallState::InProgress).await {
                        Ok(_) => {
                            create_tx.commit().await?;
                            info!(call_id = %call_id, "call created on first packet");
                        }
                        Err(StoreError::CallAlreadyExists(_)) => {
                            create_tx.rollback().await?;
                            debug!(
                                call_id = %call_id,
                                "lost first-packet creation race, retrying locked read"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                    continue;
                }
            };

            let expected = call.last_sequence + 1;

            match tx.insert_packet(call_id, sequence, data, timestamp).await {
                Ok(()) => {}
                Err(StoreError::DuplicatePacket { .. }) => {
                    tx.commit().await?;
                    debug!(
                        call_id = %call_id,
                        sequence,
                        "duplicate packet absorbed"
                    );
                    return Ok(IngestAck {
                        call_id: call_id.to_string(),
                        sequence,
                        duplicate: true,
                        anomaly: None,
                    });
                }
                Err(err) => return Err(err),
            }

            // Monotonic max: a late lower-numbered packet never walks
            // last_sequence backwards.
            if sequence > call.last_sequence {
                tx.update_call(call_id, None, Some(sequence)).await?;
            }
            tx.commit().await?;

            let anomaly = if sequence == expected {
                None
            } else {
                let anomaly = if sequence > expected {
                    SequenceAnomaly::Gap { expected }
                } else {
                    SequenceAnomaly::Reorder { expected }
                };
                warn!(
                    call_id = %call_id,
                    sequence,
                    expected,
                    kind = anomaly.kind(),
                    "sequence anomaly, packet persisted anyway"
                );
                Some(anomaly)
            };

            return Ok(IngestAck {
                call_id: call_id.to_string(),
                sequence,
                duplicate: false,
                anomaly,
            });
        }
    }
}
