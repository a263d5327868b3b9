//! Content processing interface.
//!
//! Parsing, chunking, embedding, and the vector-database sink live outside
//! this crate; the pipeline only needs a seam to hand each document through
//! and a typed outcome back. Skip-and-continue conditions are values, not
//! errors: a returned `Err` from [`DocumentProcessor::process`] means the
//! whole batch cannot continue.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::DocumentDescriptor;

/// Typed per-document result of the content pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Parsed, chunked, and forwarded to the sink.
    Processed { chunks_created: u64 },
    /// Deliberately not processed (unsupported type, empty content, ...).
    /// The document stays pending and counts as neither success nor failure.
    Skipped { reason: String },
    /// Processing failed for this document only; the batch continues.
    Failed { error: String },
}

/// Processes one document's content. Implementations must be idempotent per
/// path: at-least-once discovery can hand the same document over twice.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, doc: &DocumentDescriptor) -> Result<ProcessOutcome>;
}

/// Marks every document processed without touching its content. Used when
/// the pipeline runs for discovery and classification bookkeeping only, and
/// by the integration tests.
pub struct NoopProcessor;

#[async_trait]
impl DocumentProcessor for NoopProcessor {
    fn name(&self) -> &str {
        "noop"
    }

    async fn process(&self, _doc: &DocumentDescriptor) -> Result<ProcessOutcome> {
        Ok(ProcessOutcome::Processed { chunks_created: 0 })
    }
}
