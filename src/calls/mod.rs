//! # Call Processing Pipeline
//!
//! The two halves of the coordination kernel: the ingestion coordinator,
//! which admits packets under the call's row lock and returns fast, and the
//! processor, which drives each call through the transcription retry loop
//! asynchronously.

pub mod ingest;
pub mod processor;

pub use ingest::{IngestAck, IngestionCoordinator, SequenceAnomaly};
pub use processor::CallProcessor;
