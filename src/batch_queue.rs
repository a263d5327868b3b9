//! Persistent document batch queue.
//!
//! Holds the payload of every discovered batch as one JSON file per batch
//! (`cache/batches/batch_<collection>_<id>.json`), tracked independently from
//! the Batch Lifecycle State Store so either store can be rebuilt from the
//! other. A batch file is immutable once written; its outcome is recorded in
//! a sibling marker file, which is what makes state-store reconciliation
//! against queue contents trustworthy.
//!
//! Single writer per collection; concurrent writers must be serialized by
//! the caller.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::DocumentDescriptor;
use crate::persist;

/// Payload of one batch: ordered descriptors plus free-form metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFile {
    pub collection: String,
    pub batch_id: u64,
    pub created_at: DateTime<Utc>,
    pub documents: Vec<DocumentDescriptor>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    Processed,
    Failed,
}

/// Sibling marker recording a batch's terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMarker {
    pub status: MarkerStatus,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Aggregate view of the queue for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total_batches: usize,
    pub unprocessed: usize,
    pub processed: usize,
    pub failed: usize,
    pub disk_bytes: u64,
}

pub struct BatchQueue {
    dir: PathBuf,
    collection: String,
}

impl BatchQueue {
    pub fn new(batches_dir: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            dir: batches_dir.into(),
            collection: collection.into(),
        }
    }

    pub fn batch_path(&self, batch_id: u64) -> PathBuf {
        self.dir
            .join(format!("batch_{}_{}.json", self.collection, batch_id))
    }

    fn marker_path(&self, batch_id: u64) -> PathBuf {
        self.dir
            .join(format!("batch_{}_{}.marker.json", self.collection, batch_id))
    }

    /// Persist a new batch. Refuses to overwrite: batch files are immutable.
    pub fn save_batch(
        &self,
        batch_id: u64,
        documents: Vec<DocumentDescriptor>,
        metadata: Value,
    ) -> Result<()> {
        let path = self.batch_path(batch_id);
        if path.exists() {
            bail!(
                "Batch {} of '{}' already exists; batch files are immutable",
                batch_id,
                self.collection
            );
        }

        let file = BatchFile {
            collection: self.collection.clone(),
            batch_id,
            created_at: Utc::now(),
            documents,
            metadata,
        };
        persist::atomic_write_json(&path, &file)
            .with_context(|| format!("Failed to write batch {}", batch_id))?;
        Ok(())
    }

    /// All batch ids present on disk, ascending.
    pub fn list_batch_ids(&self) -> Result<Vec<u64>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.dir.display()))
            }
        };

        let prefix = format!("batch_{}_", self.collection);
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = parse_batch_id(&name, &prefix) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Batch ids lacking a processed/failed marker, ascending.
    pub fn get_unprocessed_batches(&self) -> Result<Vec<u64>> {
        Ok(self
            .list_batch_ids()?
            .into_iter()
            .filter(|id| !self.marker_path(*id).exists())
            .collect())
    }

    pub fn get_batch_documents(&self, batch_id: u64) -> Result<BatchFile> {
        let path = self.batch_path(batch_id);
        persist::load_json::<BatchFile>(&path)
            .with_context(|| format!("Failed to read batch {}", batch_id))?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Batch {} of '{}' not found at {}",
                    batch_id,
                    self.collection,
                    path.display()
                )
            })
    }

    pub fn get_marker(&self, batch_id: u64) -> Result<Option<BatchMarker>> {
        Ok(persist::load_json(&self.marker_path(batch_id))?)
    }

    pub fn mark_batch_processed(
        &self,
        batch_id: u64,
        success_count: u64,
        failure_count: u64,
    ) -> Result<()> {
        self.write_marker(
            batch_id,
            BatchMarker {
                status: MarkerStatus::Processed,
                at: Utc::now(),
                success_count,
                failure_count,
                errors: Vec::new(),
            },
        )
    }

    pub fn mark_batch_failed(&self, batch_id: u64, error: &str) -> Result<()> {
        self.write_marker(
            batch_id,
            BatchMarker {
                status: MarkerStatus::Failed,
                at: Utc::now(),
                success_count: 0,
                failure_count: 0,
                errors: vec![error.to_string()],
            },
        )
    }

    fn write_marker(&self, batch_id: u64, marker: BatchMarker) -> Result<()> {
        if !self.batch_path(batch_id).exists() {
            bail!(
                "Cannot mark batch {} of '{}': batch file does not exist",
                batch_id,
                self.collection
            );
        }
        persist::atomic_write_json(&self.marker_path(batch_id), &marker)
            .with_context(|| format!("Failed to write marker for batch {}", batch_id))?;
        Ok(())
    }

    pub fn get_queue_status(&self) -> Result<QueueStatus> {
        let ids = self.list_batch_ids()?;
        let mut status = QueueStatus {
            total_batches: ids.len(),
            unprocessed: 0,
            processed: 0,
            failed: 0,
            disk_bytes: 0,
        };

        for id in ids {
            status.disk_bytes += std::fs::metadata(self.batch_path(id))
                .map(|m| m.len())
                .unwrap_or(0);
            match self.get_marker(id)? {
                Some(marker) if marker.status == MarkerStatus::Processed => status.processed += 1,
                Some(_) => status.failed += 1,
                None => status.unprocessed += 1,
            }
        }
        Ok(status)
    }

    /// Delete all batch files and markers for this collection.
    pub fn clear_all_batches(&self) -> Result<usize> {
        let ids = self.list_batch_ids()?;
        let mut removed = 0;
        for id in &ids {
            std::fs::remove_file(self.batch_path(*id))?;
            removed += 1;
            let marker = self.marker_path(*id);
            if marker.exists() {
                std::fs::remove_file(marker)?;
            }
        }
        Ok(removed)
    }
}

/// Parse `batch_<collection>_<id>.json` file names; marker files and other
/// collections fall out naturally because their stems are not bare integers.
fn parse_batch_id(file_name: &str, prefix: &str) -> Option<u64> {
    file_name
        .strip_prefix(prefix)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
