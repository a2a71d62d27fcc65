//! # Transcription Client
//!
//! Abstract contract for the external transcription step: given a call and
//! its aggregated packet view, eventually produce a transcript and a
//! sentiment, or fail transiently. The processor treats every failure as
//! retryable up to its configured budget, so the error type carries no
//! permanent/transient split.
//!
//! The shipped implementation is [`MockTranscriptionClient`], an
//! intentionally unreliable stand-in with configurable failure probability
//! and latency; it is what the retry machinery is exercised against.

pub mod mock;

pub use mock::MockTranscriptionClient;

use async_trait::async_trait;
use std::fmt;

/// Output of a successful transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcription {
    pub transcript: String,
    pub sentiment: String,
}

/// Transcription failure. Always retryable.
#[derive(Debug)]
pub enum TranscriptionError {
    Transient(String),
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptionError::Transient(msg) => write!(f, "transcription failed: {}", msg),
        }
    }
}

impl std::error::Error for TranscriptionError {}

/// Fallible transcription operation. May be invoked concurrently for
/// distinct calls; the processor guarantees at most one in-flight
/// invocation per call.
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    async fn transcribe(
        &self,
        call_id: &str,
        audio_data: &str,
    ) -> Result<Transcription, TranscriptionError>;
}
