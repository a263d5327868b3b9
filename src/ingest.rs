//! Ingestion pipeline orchestration.
//!
//! Composes the tracker, queue, state store, document store, and processor:
//! discovery enumerates the source page by page and cuts fixed-size batches
//! into the queue; processing pulls the lowest unprocessed batch, runs each
//! document through the content pipeline, and records outcomes in both the
//! state store and the document store.
//!
//! # Durability
//!
//! The discovery cursor only advances past documents that are durably
//! batched. A crash therefore never loses documents: the worst case is
//! re-yielding everything since the last durable batch boundary, and the
//! batching loop skips descriptors the store already knows, so replays do
//! not produce duplicate batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::batch_queue::BatchQueue;
use crate::batch_state::BatchStateStore;
use crate::config::Config;
use crate::connector::SourceConnector;
use crate::discovery::DiscoveryTracker;
use crate::models::{DocumentDescriptor, DocumentRecord, ProcessingStatus};
use crate::processor::{DocumentProcessor, ProcessOutcome};
use crate::progress::{PipelineEvent, ProgressReporter};
use crate::store::{DocumentStore, StoreError};

/// Cooperative cancellation flag, raised from a signal handler. Loops check
/// it at batch and page boundaries; on interruption buffers are flushed and
/// the cursor is left in a resumable state before the error surfaces.
#[derive(Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub discovered: u64,
    pub batches_created: u64,
    pub already_complete: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessingSummary {
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub documents_skipped: u64,
    pub chunks_created: u64,
    pub processing_complete: bool,
}

/// Run discovery for one collection to completion (or resume it), cutting
/// one queue batch plus one state record per `batch_size` documents.
pub async fn run_discovery(
    config: &Config,
    connector: &dyn SourceConnector,
    store: &mut DocumentStore,
    reporter: &dyn ProgressReporter,
    interrupt: &Interrupt,
) -> Result<DiscoverySummary> {
    let collection = connector.name();
    let source_path = connector.source_path();
    let batch_size = config.discovery.batch_size;

    let queue = BatchQueue::new(config.cache.batches_dir(), collection);
    let mut state = BatchStateStore::load_or_create(
        &config.cache.batches_dir(),
        collection,
        &source_path,
        batch_size,
    )?;
    state.sync_with_queue(&queue)?;

    let mut tracker = DiscoveryTracker::start_or_resume(
        &config.cache.discovery_dir(),
        collection,
        &source_path,
        config.discovery.cursor_flush_every,
    )?;

    if tracker.is_complete() {
        info!(collection, "discovery already complete; nothing to do");
        return Ok(DiscoverySummary {
            discovered: tracker.progress().total_discovered,
            batches_created: tracker.progress().total_batches_created,
            already_complete: true,
        });
    }

    if tracker.progress().estimated_total.is_none() {
        tracker.estimate_total(connector).await;
    }

    let mut summary = DiscoverySummary::default();
    let mut carry: Vec<DocumentDescriptor> = Vec::new();
    let mut cursor = tracker.cursor().map(str::to_string);

    loop {
        if interrupt.is_raised() {
            store.flush_buffer()?;
            bail!("discovery interrupted; progress saved, rerun to resume");
        }

        let page = match connector.next_page(cursor.as_deref(), config.discovery.page_size).await {
            Ok(page) => page,
            Err(e) => {
                tracker.record_error(&e.to_string());
                store.flush_buffer()?;
                return Err(e).with_context(|| format!("discovery of '{}' failed", collection));
            }
        };

        for doc in page.items {
            // At-least-once replay after a crash: anything the store already
            // holds went into a batch before the crash.
            if store.contains(&doc.path) {
                continue;
            }

            tracker.record_documents(1, Some(&doc.path))?;
            summary.discovered += 1;
            carry.push(doc);

            if carry.len() >= batch_size {
                let batch: Vec<DocumentDescriptor> = carry.drain(..batch_size).collect();
                cut_batch(&mut state, &queue, store, &mut tracker, batch, reporter)?;
                summary.batches_created += 1;
            }
        }

        cursor = page.next_cursor;

        // Only a position with nothing in flight is safe to resume from.
        if carry.is_empty() {
            tracker.advance(cursor.clone())?;
        }

        reporter.report(PipelineEvent::Discovering {
            collection: collection.to_string(),
            discovered: tracker.progress().total_discovered,
            estimated_total: tracker.progress().estimated_total,
        });

        if cursor.is_none() {
            break;
        }
    }

    if !carry.is_empty() {
        let batch: Vec<DocumentDescriptor> = std::mem::take(&mut carry);
        cut_batch(&mut state, &queue, store, &mut tracker, batch, reporter)?;
        summary.batches_created += 1;
    }

    tracker.complete()?;
    state.mark_discovery_complete()?;
    store.mark_discovery_complete()?;

    info!(
        collection,
        discovered = summary.discovered,
        batches = summary.batches_created,
        "discovery complete"
    );
    Ok(summary)
}

/// Persist one batch across all three stores.
///
/// Order matters for crash recovery: the state record exists before the
/// queue file (a record without a file is marked failed by processing and
/// its documents are re-yielded on the next run), and documents land in the
/// store last, which is what marks them as durably batched.
fn cut_batch(
    state: &mut BatchStateStore,
    queue: &BatchQueue,
    store: &mut DocumentStore,
    tracker: &mut DiscoveryTracker,
    documents: Vec<DocumentDescriptor>,
    reporter: &dyn ProgressReporter,
) -> Result<()> {
    let collection = state.state().collection.clone();
    let count = documents.len();

    let batch_id = state.create_batch(count as u64)?;
    queue.save_batch(
        batch_id,
        documents.clone(),
        json!({ "collection": collection, "created_by": "discovery" }),
    )?;
    store.add_batch(documents.into_iter().map(DocumentRecord::from_descriptor))?;
    tracker.record_batch_created()?;

    reporter.report(PipelineEvent::BatchCreated {
        collection,
        batch_id,
        documents: count,
    });
    Ok(())
}

/// Process every unprocessed batch of a collection, lowest id first.
pub async fn run_processing(
    config: &Config,
    collection: &str,
    source_path: &str,
    processor: &dyn DocumentProcessor,
    store: &mut DocumentStore,
    reporter: &dyn ProgressReporter,
    interrupt: &Interrupt,
) -> Result<ProcessingSummary> {
    let queue = BatchQueue::new(config.cache.batches_dir(), collection);
    let mut state = BatchStateStore::load_or_create(
        &config.cache.batches_dir(),
        collection,
        source_path,
        config.discovery.batch_size,
    )?;

    // A later discovery run may have extended the queue behind the state
    // store's back; reconcile before trusting any completion claim.
    state.sync_with_queue(&queue)?;

    let mut summary = ProcessingSummary::default();

    while let Some(batch_id) = state.get_next_unprocessed_batch() {
        if interrupt.is_raised() {
            store.flush_buffer()?;
            bail!("processing interrupted; batch state saved, rerun to resume");
        }

        let batch = match queue.get_batch_documents(batch_id) {
            Ok(batch) => batch,
            Err(e) => {
                // State record without a queue file: a discovery run crashed
                // between the two writes. Its documents were re-batched.
                warn!(batch_id, error = %e, "batch file unreadable; marking failed");
                state.mark_batch_failed(batch_id, &format!("batch file unreadable: {}", e))?;
                summary.batches_failed += 1;
                continue;
            }
        };

        let mut success = 0u64;
        let mut failure = 0u64;
        let mut errors = Vec::new();

        for doc in &batch.documents {
            let outcome = match processor.process(doc).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Non-recoverable: fail the whole batch and surface it.
                    state.mark_batch_failed(batch_id, &e.to_string())?;
                    queue.mark_batch_failed(batch_id, &e.to_string())?;
                    store.flush_buffer()?;
                    return Err(e)
                        .with_context(|| format!("processing batch {} failed", batch_id));
                }
            };

            match outcome {
                ProcessOutcome::Processed { chunks_created } => {
                    record_outcome(
                        store,
                        &doc.path,
                        ProcessingStatus::Processed,
                        chunks_created,
                        None,
                    )?;
                    success += 1;
                    summary.chunks_created += chunks_created;
                }
                ProcessOutcome::Skipped { reason } => {
                    info!(path = %doc.path, reason = %reason, "document skipped");
                    summary.documents_skipped += 1;
                }
                ProcessOutcome::Failed { error } => {
                    record_outcome(store, &doc.path, ProcessingStatus::Failed, 0, Some(&error))?;
                    errors.push(format!("{}: {}", doc.path, error));
                    failure += 1;
                }
            }
        }

        state.mark_batch_processed(batch_id, success, failure, errors)?;
        queue.mark_batch_processed(batch_id, success, failure)?;
        summary.batches_processed += 1;
        summary.documents_processed += success;
        summary.documents_failed += failure;

        reporter.report(PipelineEvent::BatchProcessed {
            collection: collection.to_string(),
            batch_id,
            success,
            failure,
        });
    }

    store.flush_buffer()?;

    if state.get_next_unprocessed_batch().is_none() {
        state.mark_processing_complete()?;
        summary.processing_complete = true;
    }

    info!(
        collection,
        batches = summary.batches_processed,
        documents = summary.documents_processed,
        failed = summary.documents_failed,
        "processing complete"
    );
    Ok(summary)
}

/// Record one document outcome, tolerating documents the store never saw
/// (possible when a store file was rebuilt while queue files survived).
fn record_outcome(
    store: &mut DocumentStore,
    path: &str,
    status: ProcessingStatus,
    chunks_created: u64,
    error: Option<&str>,
) -> Result<()> {
    match store.set_document_outcome(path, status, chunks_created, error.map(str::to_string)) {
        Ok(()) => Ok(()),
        Err(StoreError::UnknownDocument(_)) => {
            warn!(path, "outcome for document unknown to the store");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Discovery followed by processing, the default `docflow run` flow.
pub async fn run_pipeline(
    config: &Config,
    connector: &dyn SourceConnector,
    processor: &dyn DocumentProcessor,
    store: &mut DocumentStore,
    reporter: &dyn ProgressReporter,
    interrupt: &Interrupt,
) -> Result<(DiscoverySummary, ProcessingSummary)> {
    let discovery = run_discovery(config, connector, store, reporter, interrupt).await?;
    let processing = run_processing(
        config,
        connector.name(),
        &connector.source_path(),
        processor,
        store,
        reporter,
        interrupt,
    )
    .await?;
    Ok((discovery, processing))
}
