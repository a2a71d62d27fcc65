//! # Mock Transcription Service
//!
//! Simulates a flaky external transcription API: configurable failure
//! probability (default 0.25) and uniform random latency (default 1-3 s).
//! Sentiment is derived deterministically from the call id so repeated runs
//! against the same call agree.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{info, warn};

use super::{Transcription, TranscriptionClient, TranscriptionError};

const SENTIMENTS: [&str; 4] = ["positive", "negative", "neutral", "mixed"];

/// Fault-injecting transcription client.
pub struct MockTranscriptionClient {
    failure_rate: f64,
    /// Simulated latency bounds in seconds.
    latency_secs: (f64, f64),
    call_count: AtomicU64,
    failure_count: AtomicU64,
}

impl MockTranscriptionClient {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate,
            latency_secs: (1.0, 3.0),
            call_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    /// Override the simulated latency bounds. Tests set these to zero so
    /// timing assertions only measure the retry backoff.
    #[cfg(test)]
    pub fn with_latency_secs(mut self, min: f64, max: f64) -> Self {
        self.latency_secs = (min, max);
        self
    }

    /// Total transcribe invocations since construction.
    #[cfg(test)]
    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Invocations that ended in a simulated failure.
    #[cfg(test)]
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    fn sentiment_for(call_id: &str) -> &'static str {
        let mut hasher = DefaultHasher::new();
        call_id.hash(&mut hasher);
        SENTIMENTS[(hasher.finish() % SENTIMENTS.len() as u64) as usize]
    }
}

#[async_trait]
impl TranscriptionClient for MockTranscriptionClient {
    async fn transcribe(
        &self,
        call_id: &str,
        audio_data: &str,
    ) -> Result<Transcription, TranscriptionError> {
        let calls = self.call_count.fetch_add(1, Ordering::Relaxed) + 1;

        let (min, max) = self.latency_secs;
        let latency = if max - min > f64::EPSILON {
            rand::thread_rng().gen_range(min..max)
        } else {
            min
        };
        if latency > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(latency)).await;
        }

        if rand::thread_rng().gen::<f64>() < self.failure_rate {
            let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                call_id = %call_id,
                failures,
                calls,
                "simulated transcription outage"
            );
            return Err(TranscriptionError::Transient(
                "503 Service Unavailable: transcription service temporarily down".to_string(),
            ));
        }

        info!(
            call_id = %call_id,
            latency_secs = format!("{:.2}", latency).as_str(),
            "transcription succeeded"
        );

        Ok(Transcription {
            transcript: format!(
                "Transcript for call {} ({} bytes of audio metadata)",
                call_id,
                audio_data.len()
            ),
            sentiment: Self::sentiment_for(call_id).to_string(),
        })
    }
}
