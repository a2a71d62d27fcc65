//! # Call Data Model & State Machine
//!
//! Row types for the persisted call entities and the call lifecycle state
//! machine. Packets are written through the store but never read back as
//! rows; only their aggregate (count, concatenated data) surfaces here.
//! The state machine is a pure
//! function over `(current, proposed)`; it performs no I/O and is the single
//! authority on which lifecycle advances are legal.
//!
//! ## Call Lifecycle:
//! 1. **IN_PROGRESS**: created on first packet, accepting packets
//! 2. **PROCESSING_AI**: a worker has claimed the call for transcription
//! 3. **COMPLETED**: transcript and sentiment stored
//! 4. **FAILED**: retries exhausted (re-entry into processing permitted)
//! 5. **ARCHIVED**: terminal, frozen

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a call. Stored as text in the database and rendered
/// in API responses in SCREAMING_SNAKE form (`IN_PROGRESS`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Accepting packets, no processing started yet
    InProgress,
    /// A worker owns the call and is invoking the transcription service
    ProcessingAi,
    /// AI result stored
    Completed,
    /// Retry budget exhausted
    Failed,
    /// Terminal, frozen
    Archived,
}

impl CallState {
    /// States reachable from `self` in one legal transition.
    pub fn valid_transitions(&self) -> &'static [CallState] {
        match self {
            CallState::InProgress => &[
                CallState::ProcessingAi,
                CallState::Failed,
                CallState::Completed,
            ],
            CallState::ProcessingAi => &[CallState::Completed, CallState::Failed],
            CallState::Failed => &[CallState::ProcessingAi, CallState::Archived],
            CallState::Completed => &[CallState::Archived],
            CallState::Archived => &[],
        }
    }

    /// Check whether advancing to `new_state` is legal.
    pub fn can_transition_to(&self, new_state: CallState) -> bool {
        self.valid_transitions().contains(&new_state)
    }

    /// Checked transition. Returns the new state, or `TransitionError` when
    /// the edge is not in the lifecycle graph.
    pub fn transition(self, new_state: CallState) -> Result<CallState, TransitionError> {
        if self.can_transition_to(new_state) {
            Ok(new_state)
        } else {
            Err(TransitionError {
                from: self,
                to: new_state,
            })
        }
    }

    /// Database / API string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::InProgress => "IN_PROGRESS",
            CallState::ProcessingAi => "PROCESSING_AI",
            CallState::Completed => "COMPLETED",
            CallState::Failed => "FAILED",
            CallState::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(CallState::InProgress),
            "PROCESSING_AI" => Ok(CallState::ProcessingAi),
            "COMPLETED" => Ok(CallState::Completed),
            "FAILED" => Ok(CallState::Failed),
            "ARCHIVED" => Ok(CallState::Archived),
            other => Err(format!("unknown call state '{}'", other)),
        }
    }
}

/// Rejected lifecycle advance. This is a programmer error when it surfaces
/// from the processor; the worker logs it and aborts without writing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: CallState,
    pub to: CallState,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal call state transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Processing status of an AI result row. Stored lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiStatus {
    Processing,
    Completed,
    Failed,
}

impl AiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiStatus::Processing => "processing",
            AiStatus::Completed => "completed",
            AiStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(AiStatus::Processing),
            "completed" => Ok(AiStatus::Completed),
            "failed" => Ok(AiStatus::Failed),
            other => Err(format!("unknown ai status '{}'", other)),
        }
    }
}

/// A call row. `last_sequence` starts at -1 and only ever grows; it is the
/// highest sequence number observed for the call, updated in the same
/// transaction as the packet insert that motivated it.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub call_id: String,
    pub state: CallState,
    pub last_sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// AI processing result, one-to-one with a call. Created when a worker
/// first claims the call; mutated only by the processor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallAiResult {
    pub call_id: String,
    pub transcript: Option<String>,
    pub sentiment: Option<String>,
    pub status: AiStatus,
    pub retry_count: i64,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Partial update for the AI result upsert. `None` leaves a column
/// untouched; `error_message` is doubly optional so a successful attempt
/// can clear a stale error from an earlier retry.
#[derive(Debug, Clone, Default)]
pub struct AiResultPatch {
    pub status: Option<AiStatus>,
    pub transcript: Option<String>,
    pub sentiment: Option<String>,
    pub retry_count: Option<i64>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<Option<String>>,
}

/// Read-only aggregate for the status endpoint.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call: Call,
    pub packet_count: i64,
    pub ai_result: Option<CallAiResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(CallState::InProgress.can_transition_to(CallState::ProcessingAi));
        assert!(CallState::InProgress.can_transition_to(CallState::Failed));
        assert!(CallState::InProgress.can_transition_to(CallState::Completed));
        assert!(CallState::ProcessingAi.can_transition_to(CallState::Completed));
        assert!(CallState::ProcessingAi.can_transition_to(CallState::Failed));
        assert!(CallState::Failed.can_transition_to(CallState::ProcessingAi));
        assert!(CallState::Failed.can_transition_to(CallState::Archived));
        assert!(CallState::Completed.can_transition_to(CallState::Archived));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        // Archived is terminal
        for target in [
            CallState::InProgress,
            CallState::ProcessingAi,
            CallState::Completed,
            CallState::Failed,
            CallState::Archived,
        ] {
            assert!(!CallState::Archived.can_transition_to(target));
        }

        assert!(!CallState::Completed.can_transition_to(CallState::InProgress));
        assert!(!CallState::Completed.can_transition_to(CallState::ProcessingAi));
        assert!(!CallState::ProcessingAi.can_transition_to(CallState::InProgress));
        assert!(!CallState::InProgress.can_transition_to(CallState::Archived));

        let err = CallState::Completed
            .transition(CallState::ProcessingAi)
            .unwrap_err();
        assert_eq!(err.from, CallState::Completed);
        assert_eq!(err.to, CallState::ProcessingAi);
    }

    #[test]
    fn test_checked_transition_returns_new_state() {
        let next = CallState::InProgress
            .transition(CallState::ProcessingAi)
            .unwrap();
        assert_eq!(next, CallState::ProcessingAi);
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            CallState::InProgress,
            CallState::ProcessingAi,
            CallState::Completed,
            CallState::Failed,
            CallState::Archived,
        ] {
            assert_eq!(state.as_str().parse::<CallState>().unwrap(), state);
        }
        assert!("BOGUS".parse::<CallState>().is_err());
    }

    #[test]
    fn test_state_serde_form() {
        let json = serde_json::to_string(&CallState::ProcessingAi).unwrap();
        assert_eq!(json, "\"PROCESSING_AI\"");
        let back: CallState = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(back, CallState::InProgress);
    }

    #[test]
    fn test_ai_status_round_trip() {
        for status in [AiStatus::Processing, AiStatus::Completed, AiStatus::Failed] {
            assert_eq!(status.as_str().parse::<AiStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&AiStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
