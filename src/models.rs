//! Core data models used throughout docflow.
//!
//! These types represent the documents, batches, and classification jobs that
//! flow through the discovery and processing pipeline. Everything here is a
//! plain serde record: the on-disk stores persist these shapes verbatim, so
//! a field rename is a schema change (see `store::SCHEMA_VERSION`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw descriptor produced by a connector page, before enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentDescriptor {
    /// Source-relative path. The de-duplication key across the pipeline.
    pub path: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub content_hash: String,
    #[serde(default)]
    pub source_url: Option<String>,
    /// Connector-specific business metadata (deal ids, owners, locale dates).
    /// Free-form by nature; everything else in this file is typed.
    #[serde(default)]
    pub business: Value,
}

/// Per-document processing status in the Discovery Document Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processed,
    Failed,
}

/// Classification placeholder on a document record. Filled in when an
/// external batch job's results are applied, arbitrarily later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub label: Option<String>,
    /// Model confidence. Sanitized to `None` if the provider returns a
    /// non-finite value.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub classified_at: Option<DateTime<Utc>>,
}

/// Canonical record of one discovered document in the Discovery Document Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub path: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub content_hash: String,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub business: Value,
    #[serde(default)]
    pub classification: Classification,
    #[serde(default)]
    pub status: ProcessingStatus,
    #[serde(default)]
    pub chunks_created: u64,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DocumentRecord {
    /// Build a fresh (pending) record from a connector descriptor.
    pub fn from_descriptor(desc: DocumentDescriptor) -> Self {
        let extension = std::path::Path::new(&desc.path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        Self {
            path: desc.path,
            size: desc.size,
            modified_at: desc.modified_at,
            content_hash: desc.content_hash,
            extension,
            source_url: desc.source_url,
            business: desc.business,
            classification: Classification::default(),
            status: ProcessingStatus::Pending,
            chunks_created: 0,
            processed_at: None,
            error: None,
        }
    }
}

/// Resumable pagination state for one enumeration run of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    pub source_path: String,
    /// Opaque resume token from the connector. `None` before the first page
    /// and after completion.
    pub cursor: Option<String>,
    pub total_discovered: u64,
    pub total_batches_created: u64,
    pub last_discovered_path: Option<String>,
    pub discovery_complete: bool,
    pub estimated_total: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl DiscoveryProgress {
    pub fn new(source_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            source_path: source_path.into(),
            cursor: None,
            total_discovered: 0,
            total_batches_created: 0,
            last_discovered_path: None,
            discovery_complete: false,
            estimated_total: None,
            started_at: now,
            updated_at: now,
            errors: Vec::new(),
        }
    }

    /// Repair the `discovery_complete ⇒ cursor == None` invariant after load.
    /// A stale cursor on a completed run is dropped rather than trusted.
    pub fn enforce_invariants(&mut self) {
        if self.discovery_complete {
            self.cursor = None;
        }
    }
}

/// Per-batch lifecycle record inside the Batch Lifecycle State Store.
///
/// State machine: created → processed | failed. Both terminal states keep
/// their timestamp; they are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub batch_id: u64,
    pub batch_size: usize,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
    pub document_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BatchInfo {
    pub fn new(batch_id: u64, batch_size: usize, document_count: u64) -> Self {
        Self {
            batch_id,
            batch_size,
            discovered_at: Utc::now(),
            processed_at: None,
            failed_at: None,
            document_count,
            success_count: 0,
            failure_count: 0,
            errors: Vec::new(),
        }
    }

    /// A batch is terminal once it has been processed or failed.
    pub fn is_terminal(&self) -> bool {
        self.processed_at.is_some() || self.failed_at.is_some()
    }
}

/// Collection-level batch bookkeeping, persisted as one JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub collection: String,
    pub source_path: String,
    pub batch_size: usize,
    pub total_documents: u64,
    pub total_batches: u64,
    pub discovery_complete: bool,
    pub processing_complete: bool,
    /// Keyed by batch id; BTreeMap keeps ids ordered so "lowest non-terminal"
    /// is a linear scan in id order.
    #[serde(default)]
    pub batches: BTreeMap<u64, BatchInfo>,
    pub updated_at: DateTime<Utc>,
}

impl BatchState {
    pub fn new(
        collection: impl Into<String>,
        source_path: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            collection: collection.into(),
            source_path: source_path.into(),
            batch_size,
            total_documents: 0,
            total_batches: 0,
            discovery_complete: false,
            processing_complete: false,
            batches: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Lifecycle status of one external classification batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Expired | JobStatus::Cancelled
        )
    }
}

/// Bookkeeping for one submitted classification job, stored inside the
/// Discovery Document Store's metadata section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobRecord {
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
    pub document_count: u64,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    pub status: JobStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_cost: Option<f64>,
    #[serde(default)]
    pub results_applied: bool,
}

impl BatchJobRecord {
    pub fn new(
        job_id: impl Into<String>,
        document_count: u64,
        estimated_cost: Option<f64>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            submitted_at: Utc::now(),
            document_count,
            estimated_cost,
            status: JobStatus::Submitted,
            completed_at: None,
            actual_cost: None,
            results_applied: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ProcessingStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn batch_info_terminal() {
        let mut info = BatchInfo::new(1, 50, 50);
        assert!(!info.is_terminal());
        info.processed_at = Some(Utc::now());
        assert!(info.is_terminal());
    }

    #[test]
    fn progress_invariant_repair() {
        let mut progress = DiscoveryProgress::new("/data/docs");
        progress.cursor = Some("page-3".into());
        progress.discovery_complete = true;
        progress.enforce_invariants();
        assert!(progress.cursor.is_none());
    }

    #[test]
    fn record_from_descriptor_extracts_extension() {
        let desc = DocumentDescriptor {
            path: "deals/2024/contract.PDF".into(),
            size: 1024,
            modified_at: Utc::now(),
            content_hash: "abc".into(),
            source_url: None,
            business: Value::Null,
        };
        let record = DocumentRecord::from_descriptor(desc);
        assert_eq!(record.extension.as_deref(), Some("pdf"));
        assert_eq!(record.status, ProcessingStatus::Pending);
    }

    #[test]
    fn record_without_extension() {
        let desc = DocumentDescriptor {
            path: "deals/2024/README".into(),
            size: 1,
            modified_at: Utc::now(),
            content_hash: "abc".into(),
            source_url: None,
            business: Value::Null,
        };
        let record = DocumentRecord::from_descriptor(desc);
        assert_eq!(record.extension, None);
    }

    #[test]
    fn batch_state_map_roundtrip() {
        let mut state = BatchState::new("deals", "/data/deals", 50);
        state.batches.insert(1, BatchInfo::new(1, 50, 50));
        state.batches.insert(2, BatchInfo::new(2, 50, 20));
        let json = serde_json::to_string(&state).unwrap();
        let back: BatchState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batches.len(), 2);
        assert_eq!(back.batches[&2].document_count, 20);
    }
}
