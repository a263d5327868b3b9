//! Batch lifecycle state store.
//!
//! The authoritative per-collection record of batch existence and outcome,
//! persisted as `cache/batches/batch_state_<collection>.json` and rewritten
//! in full on every mutation. Payload lives in the batch queue; this store
//! only tracks the state machine:
//!
//! ```text
//! created ──▶ processed (success/failure counts)
//!        └──▶ failed    (terminal, error strings)
//! ```
//!
//! There is no retry-in-place; new documents surface as new batches. The
//! store self-heals on load by reconciling against the batch files actually
//! present in the queue, which protects against a second discovery run
//! extending a queue this store has never seen.
//!
//! Not multi-writer-safe: callers serialize access to one collection within
//! one process.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::batch_queue::BatchQueue;
use crate::models::{BatchInfo, BatchState};
use crate::persist;

/// Aggregate progress over all batches of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    pub total_batches: u64,
    pub processed_batches: u64,
    pub failed_batches: u64,
    pub pending_batches: u64,
    pub total_documents: u64,
    pub total_processed_docs: u64,
    pub total_failed_docs: u64,
    /// Share of documents sitting in terminal batches, 0.0–100.0.
    pub progress_percentage: f64,
    pub discovery_complete: bool,
    pub processing_complete: bool,
}

pub struct BatchStateStore {
    path: PathBuf,
    state: BatchState,
}

impl BatchStateStore {
    pub fn state_path(batches_dir: &Path, collection: &str) -> PathBuf {
        batches_dir.join(format!("batch_state_{}.json", collection))
    }

    /// Load the collection's state, or create a fresh one.
    ///
    /// A loaded state that claims processing_complete while holding
    /// non-terminal batches is repaired (the claim is dropped) rather than
    /// trusted.
    pub fn load_or_create(
        batches_dir: &Path,
        collection: &str,
        source_path: &str,
        batch_size: usize,
    ) -> Result<Self> {
        let path = Self::state_path(batches_dir, collection);

        let state = match persist::load_json::<BatchState>(&path)
            .with_context(|| format!("Failed to load batch state for '{}'", collection))?
        {
            Some(mut saved) => {
                let all_terminal = saved.batches.values().all(BatchInfo::is_terminal);
                if saved.processing_complete && !all_terminal {
                    warn!(
                        collection,
                        "batch state claims processing complete with open batches; resetting"
                    );
                    saved.processing_complete = false;
                }
                saved
            }
            None => BatchState::new(collection, source_path, batch_size),
        };

        Ok(Self { path, state })
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    /// Allocate the next monotonic batch id and record the batch as created.
    pub fn create_batch(&mut self, document_count: u64) -> Result<u64> {
        let batch_id = self
            .state
            .batches
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(1);

        let info = BatchInfo::new(batch_id, self.state.batch_size, document_count);
        self.state.batches.insert(batch_id, info);
        self.state.total_batches += 1;
        self.state.total_documents += document_count;

        // A new batch invalidates any earlier completion claim.
        if self.state.processing_complete {
            self.state.processing_complete = false;
        }

        self.save()?;
        Ok(batch_id)
    }

    pub fn mark_batch_processed(
        &mut self,
        batch_id: u64,
        success_count: u64,
        failure_count: u64,
        errors: Vec<String>,
    ) -> Result<()> {
        let info = self.get_batch_mut(batch_id)?;
        if info.is_terminal() {
            bail!("Batch {} is already terminal", batch_id);
        }
        if success_count + failure_count > info.document_count {
            bail!(
                "Batch {}: counted {} outcomes for {} documents",
                batch_id,
                success_count + failure_count,
                info.document_count
            );
        }

        info.processed_at = Some(Utc::now());
        info.success_count = success_count;
        info.failure_count = failure_count;
        info.errors = errors;
        self.save()
    }

    pub fn mark_batch_failed(&mut self, batch_id: u64, error: &str) -> Result<()> {
        let info = self.get_batch_mut(batch_id)?;
        if info.is_terminal() {
            bail!("Batch {} is already terminal", batch_id);
        }

        info.failed_at = Some(Utc::now());
        info.errors.push(error.to_string());
        self.save()
    }

    /// Lowest non-terminal batch id, if any.
    pub fn get_next_unprocessed_batch(&self) -> Option<u64> {
        self.state
            .batches
            .values()
            .find(|info| !info.is_terminal())
            .map(|info| info.batch_id)
    }

    pub fn get_progress_summary(&self) -> ProgressSummary {
        let mut summary = ProgressSummary {
            total_batches: self.state.total_batches,
            processed_batches: 0,
            failed_batches: 0,
            pending_batches: 0,
            total_documents: self.state.total_documents,
            total_processed_docs: 0,
            total_failed_docs: 0,
            progress_percentage: 0.0,
            discovery_complete: self.state.discovery_complete,
            processing_complete: self.state.processing_complete,
        };

        let mut terminal_docs = 0u64;
        for info in self.state.batches.values() {
            if info.processed_at.is_some() {
                summary.processed_batches += 1;
                summary.total_processed_docs += info.success_count;
                summary.total_failed_docs += info.failure_count;
                terminal_docs += info.document_count;
            } else if info.failed_at.is_some() {
                summary.failed_batches += 1;
                summary.total_failed_docs += info.document_count;
                terminal_docs += info.document_count;
            } else {
                summary.pending_batches += 1;
            }
        }

        if self.state.total_documents > 0 {
            summary.progress_percentage =
                (terminal_docs as f64 / self.state.total_documents as f64) * 100.0;
        }
        summary
    }

    pub fn mark_discovery_complete(&mut self) -> Result<()> {
        self.state.discovery_complete = true;
        self.save()
    }

    /// Claim processing complete. Refused while any batch is non-terminal.
    pub fn mark_processing_complete(&mut self) -> Result<()> {
        if let Some(open) = self.get_next_unprocessed_batch() {
            bail!(
                "Cannot mark processing complete: batch {} is not terminal",
                open
            );
        }
        self.state.processing_complete = true;
        self.save()
    }

    pub fn reset_processing_complete(&mut self) -> Result<()> {
        self.state.processing_complete = false;
        self.save()
    }

    /// Reconcile against the batch files physically present in the queue.
    ///
    /// If the queue holds more batches than this store has recorded, totals
    /// are recomputed by summing each batch file's documents, unknown batches
    /// are registered as created, and a prior processing_complete claim is
    /// reset. Returns whether anything changed.
    pub fn sync_with_queue(&mut self, queue: &BatchQueue) -> Result<bool> {
        let disk_ids = queue.list_batch_ids()?;
        if (disk_ids.len() as u64) <= self.state.total_batches {
            return Ok(false);
        }

        info!(
            collection = %self.state.collection,
            recorded = self.state.total_batches,
            on_disk = disk_ids.len(),
            "queue holds unrecorded batches; reconciling"
        );

        let batch_size = self.state.batch_size;
        let mut total_documents = 0u64;
        for id in &disk_ids {
            let file = queue.get_batch_documents(*id)?;
            let count = file.documents.len() as u64;
            total_documents += count;
            self.state
                .batches
                .entry(*id)
                .or_insert_with(|| BatchInfo::new(*id, batch_size, count));
        }

        self.state.total_batches = disk_ids.len() as u64;
        self.state.total_documents = total_documents;
        if self.state.processing_complete {
            self.state.processing_complete = false;
        }

        self.save()?;
        Ok(true)
    }

    fn get_batch_mut(&mut self, batch_id: u64) -> Result<&mut BatchInfo> {
        self.state
            .batches
            .get_mut(&batch_id)
            .ok_or_else(|| anyhow::anyhow!("Unknown batch id {}", batch_id))
    }

    fn save(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        persist::atomic_write_json(&self.path, &self.state)
            .with_context(|| "Failed to persist batch state")
    }
}
