//! Discovery document store.
//!
//! The canonical, queryable record of every discovered document plus
//! classification-job bookkeeping, persisted as a single JSON file
//! (`<output>.json`) with a lock sentinel (`<output>.lock`) and a
//! lightweight session snapshot (`<output>.progress.json`).
//!
//! Writes are buffered and atomic: documents accumulate in memory and are
//! merged into the store on flush, which serializes the whole store to a
//! temp file and renames it over the live file under an exclusive
//! cross-process lock. After a crash the last renamed file is complete
//! truth; at most `buffer_size - 1` documents or `update_threshold - 1`
//! metadata updates are lost, and both are replayable from source.
//!
//! The backing file may be written by multiple cooperating processes (a
//! long-running ingest plus a metadata-repair tool); the lock covers each
//! read-merge-write-rename cycle, and documents present on disk but unknown
//! to this process are preserved on flush.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::models::{BatchJobRecord, DocumentRecord, JobStatus, ProcessingStatus};
use crate::persist::{self, PersistError, StoreLock};

/// Current store schema. Older stores are upgraded in place on load:
/// v1 had documents only, v2 added `metadata.batch_jobs`, v3 added the
/// `progress` section.
pub const SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("Unknown document path: {0}")]
    UnknownDocument(String),

    #[error("Unknown classification job: {0}")]
    UnknownJob(String),

    #[error("Invalid metadata update for {path}: {source}")]
    InvalidUpdate {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Job {job_id} is {status:?}; results can only be applied to a completed job")]
    JobNotCompleted { job_id: String, status: JobStatus },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub schema_version: u32,
    #[serde(default)]
    pub batch_jobs: Vec<BatchJobRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreProgress {
    #[serde(default)]
    pub discovery_complete: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_documents: u64,
    #[serde(default)]
    pub processed_documents: u64,
    #[serde(default)]
    pub failed_documents: u64,
    #[serde(default)]
    pub last_flushed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub documents: Vec<DocumentRecord>,
    pub metadata: StoreMetadata,
    #[serde(default)]
    pub progress: StoreProgress,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            documents: Vec::new(),
            metadata: StoreMetadata {
                schema_version: SCHEMA_VERSION,
                batch_jobs: Vec::new(),
            },
            progress: StoreProgress::default(),
        }
    }
}

/// Predicate options for [`DocumentStore::filter_documents`].
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Drop documents whose status is already `processed`.
    pub exclude_processed: bool,
    /// Keep only these extensions (lowercase, no dot) when set.
    pub include_extensions: Option<Vec<String>>,
    /// Always drop these extensions.
    pub exclude_extensions: Option<Vec<String>>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    /// Range over the business "creation_date" field, which is authoritative
    /// for business filtering and arrives in a locale-specific format.
    pub created_after: Option<NaiveDate>,
    pub created_before: Option<NaiveDate>,
    /// chrono format of the business creation date (e.g. `%d.%m.%Y`).
    pub creation_date_format: String,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

/// Per-reason exclusion counters from a filter pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExclusionCounts {
    pub already_processed: u64,
    pub extension: u64,
    pub modified_out_of_range: u64,
    pub creation_date_out_of_range: u64,
    pub creation_date_unparseable: u64,
    pub size_out_of_range: u64,
}

pub struct FilterResult<'a> {
    pub documents: Vec<&'a DocumentRecord>,
    pub excluded: ExclusionCounts,
}

pub struct DocumentStore {
    path: PathBuf,
    lock_path: PathBuf,
    snapshot_path: PathBuf,
    data: StoreData,
    /// path → index into `data.documents`.
    index: HashMap<String, usize>,
    buffer: Vec<DocumentRecord>,
    buffer_size: usize,
    pending_updates: usize,
    update_threshold: usize,
}

impl DocumentStore {
    /// Open (or create) the store at the configured output path, upgrading
    /// older schemas in place.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let path = config.output.clone();

        let data = match persist::load_json::<Value>(&path)? {
            Some(mut raw) => {
                upgrade_schema(&mut raw);
                serde_json::from_value(raw).map_err(|e| PersistError::Parse {
                    path: path.clone(),
                    source: e,
                })?
            }
            None => StoreData::default(),
        };

        let index = build_index(&data.documents);
        Ok(Self {
            path,
            lock_path: config.lock_path(),
            snapshot_path: config.progress_path(),
            data,
            index,
            buffer: Vec::new(),
            buffer_size: config.buffer_size.max(1),
            pending_updates: 0,
            update_threshold: config.update_threshold.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.data.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.documents.is_empty()
    }

    /// Flushed documents. Buffered documents are not visible here until the
    /// next flush.
    pub fn documents(&self) -> &[DocumentRecord] {
        &self.data.documents
    }

    pub fn progress(&self) -> &StoreProgress {
        &self.data.progress
    }

    pub fn get_document(&self, path: &str) -> Option<&DocumentRecord> {
        self.index.get(path).map(|&i| &self.data.documents[i])
    }

    /// Whether a path is known to the store, flushed or still buffered.
    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path) || self.buffer.iter().any(|d| d.path == path)
    }

    /// Buffer one document; flushes automatically once the buffer fills.
    pub fn add_document(&mut self, record: DocumentRecord) -> Result<(), StoreError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Buffer a whole batch and flush it explicitly.
    pub fn add_batch(
        &mut self,
        records: impl IntoIterator<Item = DocumentRecord>,
    ) -> Result<(), StoreError> {
        self.buffer.extend(records);
        self.flush_buffer()
    }

    /// Merge the buffer into the document list and persist the whole store.
    ///
    /// The cycle runs under the cross-process lock: re-read the live file,
    /// keep documents and jobs another process added meanwhile, overlay our
    /// state, sanitize, write temp, rename.
    pub fn flush_buffer(&mut self) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path)?;

        self.absorb_foreign_state()?;

        let drained: Vec<DocumentRecord> = self.buffer.drain(..).collect();
        for record in drained {
            self.merge_record(record);
        }

        self.recompute_progress();
        self.sanitize();

        persist::atomic_write_json(&self.path, &self.data)?;
        self.write_snapshot();
        self.pending_updates = 0;

        debug!(
            path = %self.path.display(),
            documents = self.data.documents.len(),
            "store flushed"
        );
        Ok(())
    }

    /// Merge field updates into one document, addressing nested fields with
    /// dotted paths (`"classification.label"`). By default the write is
    /// deferred: only after `update_threshold` deferred updates does the
    /// store hit the disk, trading latency for drastically less I/O under
    /// high-frequency single-field updates.
    pub fn update_document_metadata(
        &mut self,
        path: &str,
        updates: &[(String, Value)],
        save_immediately: bool,
    ) -> Result<(), StoreError> {
        let record = self
            .find_record_mut(path)
            .ok_or_else(|| StoreError::UnknownDocument(path.to_string()))?;

        // Apply on a JSON copy and re-validate through serde, so a bad
        // update leaves the record untouched.
        let mut value = serde_json::to_value(&*record).map_err(|e| StoreError::InvalidUpdate {
            path: path.to_string(),
            source: e,
        })?;
        for (key, update) in updates {
            set_dotted_path(&mut value, key, update.clone());
        }
        let updated: DocumentRecord =
            serde_json::from_value(value).map_err(|e| StoreError::InvalidUpdate {
                path: path.to_string(),
                source: e,
            })?;
        *record = updated;

        self.note_deferred_update(save_immediately)
    }

    /// Record a processing outcome for one document.
    pub fn set_document_outcome(
        &mut self,
        path: &str,
        status: ProcessingStatus,
        chunks_created: u64,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let record = self
            .find_record_mut(path)
            .ok_or_else(|| StoreError::UnknownDocument(path.to_string()))?;

        record.status = status;
        record.chunks_created = chunks_created;
        record.processed_at = Some(Utc::now());
        record.error = error;

        self.note_deferred_update(false)
    }

    /// Force a flush and stamp discovery completion.
    pub fn mark_discovery_complete(&mut self) -> Result<(), StoreError> {
        self.data.progress.discovery_complete = true;
        self.data.progress.completed_at = Some(Utc::now());
        self.flush_buffer()
    }

    // ============ Classification job bookkeeping ============

    pub fn batch_jobs(&self) -> &[BatchJobRecord] {
        &self.data.metadata.batch_jobs
    }

    /// Insert or replace a job record by job id, persisting immediately.
    /// Job transitions are rare compared to document updates.
    pub fn save_batch_job(&mut self, job: BatchJobRecord) -> Result<(), StoreError> {
        match self
            .data
            .metadata
            .batch_jobs
            .iter_mut()
            .find(|j| j.job_id == job.job_id)
        {
            Some(existing) => *existing = job,
            None => self.data.metadata.batch_jobs.push(job),
        }
        self.flush_buffer()
    }

    pub fn update_batch_job_status(
        &mut self,
        job_id: &str,
        status: JobStatus,
        actual_cost: Option<f64>,
    ) -> Result<(), StoreError> {
        let job = self.find_job_mut(job_id)?;
        job.status = status;
        if status == JobStatus::Completed && job.completed_at.is_none() {
            job.completed_at = Some(Utc::now());
        }
        if let Some(cost) = actual_cost {
            job.actual_cost = persist::finite_or_none(Some(cost));
        }
        self.flush_buffer()
    }

    /// Stamp a completed job's results as applied. Idempotent: a second call
    /// is a no-op and never re-touches the recorded cost.
    pub fn mark_batch_results_applied(&mut self, job_id: &str) -> Result<(), StoreError> {
        let job = self.find_job_mut(job_id)?;
        if job.results_applied {
            return Ok(());
        }
        if job.status != JobStatus::Completed {
            return Err(StoreError::JobNotCompleted {
                job_id: job_id.to_string(),
                status: job.status,
            });
        }
        job.results_applied = true;
        self.flush_buffer()
    }

    /// Jobs still waiting on the external service.
    pub fn get_pending_batch_jobs(&self) -> Vec<&BatchJobRecord> {
        self.data
            .metadata
            .batch_jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Submitted | JobStatus::InProgress))
            .collect()
    }

    /// Completed jobs whose results have not been applied yet.
    pub fn get_completed_batch_jobs(&self) -> Vec<&BatchJobRecord> {
        self.data
            .metadata
            .batch_jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed && !j.results_applied)
            .collect()
    }

    // ============ Filtering ============

    /// Pure predicate query over the flushed documents, returning the
    /// surviving set and per-reason exclusion counters.
    pub fn filter_documents(&self, opts: &FilterOptions) -> FilterResult<'_> {
        let mut result = FilterResult {
            documents: Vec::new(),
            excluded: ExclusionCounts::default(),
        };

        let wants_creation_range = opts.created_after.is_some() || opts.created_before.is_some();

        'docs: for doc in &self.data.documents {
            if opts.exclude_processed && doc.status == ProcessingStatus::Processed {
                result.excluded.already_processed += 1;
                continue;
            }

            if let Some(ref include) = opts.include_extensions {
                match &doc.extension {
                    Some(ext) if include.iter().any(|i| i == ext) => {}
                    _ => {
                        result.excluded.extension += 1;
                        continue;
                    }
                }
            }
            if let Some(ref exclude) = opts.exclude_extensions {
                if let Some(ext) = &doc.extension {
                    if exclude.iter().any(|e| e == ext) {
                        result.excluded.extension += 1;
                        continue;
                    }
                }
            }

            if let Some(after) = opts.modified_after {
                if doc.modified_at < after {
                    result.excluded.modified_out_of_range += 1;
                    continue;
                }
            }
            if let Some(before) = opts.modified_before {
                if doc.modified_at > before {
                    result.excluded.modified_out_of_range += 1;
                    continue;
                }
            }

            if wants_creation_range {
                let created = doc
                    .business
                    .get("creation_date")
                    .and_then(Value::as_str)
                    .and_then(|s| {
                        NaiveDate::parse_from_str(s, &opts.creation_date_format).ok()
                    });
                match created {
                    None => {
                        result.excluded.creation_date_unparseable += 1;
                        continue 'docs;
                    }
                    Some(date) => {
                        if opts.created_after.is_some_and(|after| date < after)
                            || opts.created_before.is_some_and(|before| date > before)
                        {
                            result.excluded.creation_date_out_of_range += 1;
                            continue 'docs;
                        }
                    }
                }
            }

            if opts.min_size.is_some_and(|min| doc.size < min)
                || opts.max_size.is_some_and(|max| doc.size > max)
            {
                result.excluded.size_out_of_range += 1;
                continue;
            }

            result.documents.push(doc);
        }

        result
    }

    // ============ Internals ============

    fn note_deferred_update(&mut self, save_immediately: bool) -> Result<(), StoreError> {
        self.pending_updates += 1;
        if save_immediately || self.pending_updates >= self.update_threshold {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn find_record_mut(&mut self, path: &str) -> Option<&mut DocumentRecord> {
        if let Some(&i) = self.index.get(path) {
            return self.data.documents.get_mut(i);
        }
        self.buffer.iter_mut().find(|d| d.path == path)
    }

    fn find_job_mut(&mut self, job_id: &str) -> Result<&mut BatchJobRecord, StoreError> {
        self.data
            .metadata
            .batch_jobs
            .iter_mut()
            .find(|j| j.job_id == job_id)
            .ok_or_else(|| StoreError::UnknownJob(job_id.to_string()))
    }

    /// Merge one buffered record, de-duplicating by path. A re-discovered
    /// document refreshes its file info but keeps any processing outcome and
    /// classification already recorded (at-least-once discovery must not
    /// reset work already done).
    fn merge_record(&mut self, record: DocumentRecord) {
        match self.index.get(&record.path) {
            Some(&i) => {
                let existing = &mut self.data.documents[i];
                existing.size = record.size;
                existing.modified_at = record.modified_at;
                existing.content_hash = record.content_hash;
                existing.extension = record.extension;
                existing.source_url = record.source_url;
                if !record.business.is_null() {
                    existing.business = record.business;
                }
            }
            None => {
                self.index
                    .insert(record.path.clone(), self.data.documents.len());
                self.data.documents.push(record);
            }
        }
    }

    /// Under the lock, pull in documents and jobs another process persisted
    /// since our last read. Our in-memory state wins for paths and job ids
    /// we know; everything else is preserved.
    fn absorb_foreign_state(&mut self) -> Result<(), StoreError> {
        let disk = match persist::load_json::<Value>(&self.path) {
            Ok(Some(mut raw)) => {
                upgrade_schema(&mut raw);
                match serde_json::from_value::<StoreData>(raw) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(error = %e, "live store file unreadable during merge; keeping ours");
                        return Ok(());
                    }
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for doc in disk.documents {
            if !self.index.contains_key(&doc.path) {
                self.index.insert(doc.path.clone(), self.data.documents.len());
                self.data.documents.push(doc);
            }
        }
        for job in disk.metadata.batch_jobs {
            if !self
                .data
                .metadata
                .batch_jobs
                .iter()
                .any(|j| j.job_id == job.job_id)
            {
                self.data.metadata.batch_jobs.push(job);
            }
        }
        Ok(())
    }

    fn recompute_progress(&mut self) {
        let progress = &mut self.data.progress;
        progress.total_documents = self.data.documents.len() as u64;
        progress.processed_documents = self
            .data
            .documents
            .iter()
            .filter(|d| d.status == ProcessingStatus::Processed)
            .count() as u64;
        progress.failed_documents = self
            .data
            .documents
            .iter()
            .filter(|d| d.status == ProcessingStatus::Failed)
            .count() as u64;
        progress.last_flushed_at = Some(Utc::now());
    }

    /// Rewrite non-finite floats to null before serialization; a NaN that
    /// reaches the encoder would produce output strict parsers reject.
    fn sanitize(&mut self) {
        for doc in &mut self.data.documents {
            doc.classification.confidence = persist::finite_or_none(doc.classification.confidence);
        }
        for job in &mut self.data.metadata.batch_jobs {
            job.estimated_cost = persist::finite_or_none(job.estimated_cost);
            job.actual_cost = persist::finite_or_none(job.actual_cost);
        }
    }

    /// Best-effort session snapshot next to the store; never fatal.
    fn write_snapshot(&self) {
        let snapshot = serde_json::json!({
            "total_documents": self.data.progress.total_documents,
            "processed_documents": self.data.progress.processed_documents,
            "failed_documents": self.data.progress.failed_documents,
            "discovery_complete": self.data.progress.discovery_complete,
            "pending_jobs": self.get_pending_batch_jobs().len(),
            "updated_at": Utc::now(),
        });
        if let Err(e) = persist::atomic_write_json(&self.snapshot_path, &snapshot) {
            warn!(error = %e, "failed to write progress snapshot");
        }
    }
}

fn build_index(documents: &[DocumentRecord]) -> HashMap<String, usize> {
    documents
        .iter()
        .enumerate()
        .map(|(i, d)| (d.path.clone(), i))
        .collect()
}

/// Add missing sections with safe defaults so older stores remain loadable.
fn upgrade_schema(raw: &mut Value) {
    let Some(root) = raw.as_object_mut() else {
        return;
    };

    root.entry("documents").or_insert_with(|| Value::Array(vec![]));

    let metadata = root
        .entry("metadata")
        .or_insert_with(|| serde_json::json!({}));
    if let Some(meta) = metadata.as_object_mut() {
        let version = meta
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        if version < 2 {
            meta.entry("batch_jobs").or_insert_with(|| Value::Array(vec![]));
        }
        meta.insert("schema_version".into(), Value::from(SCHEMA_VERSION));
    }

    root.entry("progress").or_insert_with(|| serde_json::json!({}));
}

/// Set `value` at a dotted path, creating intermediate objects as needed.
fn set_dotted_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(segment.to_string(), value);
            }
            return;
        }

        let Some(obj) = current.as_object_mut() else {
            return;
        };
        current = obj
            .entry(segment.to_string())
            .and_modify(|v| {
                if !v.is_object() {
                    *v = serde_json::json!({});
                }
            })
            .or_insert_with(|| serde_json::json!({}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, DocumentDescriptor};
    use serde_json::json;
    use std::path::Path;
    use tempfile::TempDir;

    fn store_config(dir: &Path) -> StoreConfig {
        StoreConfig {
            output: dir.join("discovered.json"),
            buffer_size: 100,
            update_threshold: 50,
        }
    }

    fn record(path: &str) -> DocumentRecord {
        DocumentRecord::from_descriptor(DocumentDescriptor {
            path: path.into(),
            size: 100,
            modified_at: Utc::now(),
            content_hash: "hash".into(),
            source_url: None,
            business: Value::Null,
        })
    }

    #[test]
    fn add_batch_flushes_and_dedups_by_path() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());

        let mut store = DocumentStore::open(&config).unwrap();
        store
            .add_batch(vec![record("a.pdf"), record("b.pdf"), record("a.pdf")])
            .unwrap();
        assert_eq!(store.len(), 2);

        let reopened = DocumentStore::open(&config).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.progress().total_documents, 2);
    }

    #[test]
    fn buffer_autoflushes_at_capacity() {
        let tmp = TempDir::new().unwrap();
        let mut config = store_config(tmp.path());
        config.buffer_size = 3;

        let mut store = DocumentStore::open(&config).unwrap();
        store.add_document(record("a")).unwrap();
        store.add_document(record("b")).unwrap();
        assert!(!config.output.exists(), "buffer below capacity, no write");

        store.add_document(record("c")).unwrap();
        assert!(config.output.exists(), "buffer full, store flushed");
    }

    #[test]
    fn rediscovery_keeps_processing_outcome() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();

        store.add_batch(vec![record("a.pdf")]).unwrap();
        store
            .set_document_outcome("a.pdf", ProcessingStatus::Processed, 7, None)
            .unwrap();

        let mut again = record("a.pdf");
        again.size = 999;
        store.add_batch(vec![again]).unwrap();

        let doc = store.get_document("a.pdf").unwrap();
        assert_eq!(doc.size, 999);
        assert_eq!(doc.status, ProcessingStatus::Processed);
        assert_eq!(doc.chunks_created, 7);
    }

    #[test]
    fn deferred_updates_coalesce_until_threshold() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();
        store.add_batch(vec![record("a.pdf")]).unwrap();

        // 49 deferred updates: on-disk content must not move.
        for i in 0..49 {
            store
                .update_document_metadata(
                    "a.pdf",
                    &[("business.revision".to_string(), json!(i))],
                    false,
                )
                .unwrap();
        }
        let on_disk = DocumentStore::open(&config).unwrap();
        assert!(on_disk.get_document("a.pdf").unwrap().business.get("revision").is_none());

        // The 50th crosses the threshold and performs exactly one write.
        store
            .update_document_metadata("a.pdf", &[("business.revision".to_string(), json!(49))], false)
            .unwrap();
        let on_disk = DocumentStore::open(&config).unwrap();
        assert_eq!(
            on_disk.get_document("a.pdf").unwrap().business["revision"],
            json!(49)
        );
    }

    #[test]
    fn save_immediately_bypasses_threshold() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();
        store.add_batch(vec![record("a.pdf")]).unwrap();

        store
            .update_document_metadata(
                "a.pdf",
                &[("classification.label".to_string(), json!("invoice"))],
                true,
            )
            .unwrap();

        let on_disk = DocumentStore::open(&config).unwrap();
        assert_eq!(
            on_disk
                .get_document("a.pdf")
                .unwrap()
                .classification
                .label
                .as_deref(),
            Some("invoice")
        );
    }

    #[test]
    fn bad_update_leaves_record_untouched() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();
        store.add_batch(vec![record("a.pdf")]).unwrap();

        let result = store.update_document_metadata(
            "a.pdf",
            &[("size".to_string(), json!("not a number"))],
            false,
        );
        assert!(matches!(result, Err(StoreError::InvalidUpdate { .. })));
        assert_eq!(store.get_document("a.pdf").unwrap().size, 100);
    }

    #[test]
    fn nan_confidence_serializes_to_null() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();

        let mut doc = record("a.pdf");
        doc.classification = Classification {
            label: Some("invoice".into()),
            confidence: Some(f64::NAN),
            classified_at: None,
        };
        store.add_batch(vec![doc]).unwrap();

        let raw = std::fs::read_to_string(&config.output).unwrap();
        assert!(!raw.contains("NaN"), "output must stay strict JSON");

        let reopened = DocumentStore::open(&config).unwrap();
        assert_eq!(reopened.get_document("a.pdf").unwrap().classification.confidence, None);
    }

    #[test]
    fn stray_temp_file_does_not_break_live_store() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();
        store.add_batch(vec![record("a.pdf")]).unwrap();

        // Simulate a kill between temp-write and rename.
        std::fs::write(
            config.output.with_file_name("discovered.json.tmp"),
            b"{ truncated",
        )
        .unwrap();

        let reopened = DocumentStore::open(&config).unwrap();
        assert_eq!(reopened.len(), 1);

        // The next flush still lands atomically.
        let mut reopened = reopened;
        reopened.add_batch(vec![record("b.pdf")]).unwrap();
        assert_eq!(DocumentStore::open(&config).unwrap().len(), 2);
    }

    #[test]
    fn job_lifecycle_and_idempotent_apply() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();

        store
            .save_batch_job(BatchJobRecord::new("job-1", 120, Some(0.42)))
            .unwrap();
        assert_eq!(store.get_pending_batch_jobs().len(), 1);

        // Results cannot be applied before completion.
        assert!(matches!(
            store.mark_batch_results_applied("job-1"),
            Err(StoreError::JobNotCompleted { .. })
        ));

        store
            .update_batch_job_status("job-1", JobStatus::Completed, Some(0.37))
            .unwrap();
        assert_eq!(store.get_completed_batch_jobs().len(), 1);

        store.mark_batch_results_applied("job-1").unwrap();
        store.mark_batch_results_applied("job-1").unwrap();

        let job = &store.batch_jobs()[0];
        assert!(job.results_applied);
        assert_eq!(job.actual_cost, Some(0.37));
        assert!(store.get_completed_batch_jobs().is_empty());
    }

    #[test]
    fn schema_v1_store_upgrades_on_load() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());

        // A v1-era store: documents only, no metadata or progress sections.
        std::fs::write(
            &config.output,
            serde_json::to_string(&json!({
                "documents": [{
                    "path": "old.pdf",
                    "size": 5,
                    "modified_at": "2024-01-01T00:00:00Z",
                    "content_hash": "h"
                }]
            }))
            .unwrap(),
        )
        .unwrap();

        let store = DocumentStore::open(&config).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.batch_jobs().is_empty());
        assert_eq!(store.get_document("old.pdf").unwrap().status, ProcessingStatus::Pending);
    }

    #[test]
    fn filter_counts_exclusions_per_reason() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());
        let mut store = DocumentStore::open(&config).unwrap();

        let mut processed = record("done.pdf");
        processed.status = ProcessingStatus::Processed;

        let mut wrong_ext = record("notes.txt");
        wrong_ext.extension = Some("txt".into());

        let mut dated = record("deal.pdf");
        dated.business = json!({ "creation_date": "15.03.2024" });

        let mut old = record("ancient.pdf");
        old.business = json!({ "creation_date": "01.01.2019" });

        let mut undated = record("mystery.pdf");
        undated.business = json!({});

        let mut huge = record("huge.pdf");
        huge.size = 10_000_000;
        huge.business = json!({ "creation_date": "16.03.2024" });

        store
            .add_batch(vec![processed, wrong_ext, dated, old, undated, huge])
            .unwrap();

        let result = store.filter_documents(&FilterOptions {
            exclude_processed: true,
            include_extensions: Some(vec!["pdf".into()]),
            created_after: Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            creation_date_format: "%d.%m.%Y".into(),
            max_size: Some(1_000_000),
            ..Default::default()
        });

        let paths: Vec<_> = result.documents.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["deal.pdf"]);
        assert_eq!(result.excluded.already_processed, 1);
        assert_eq!(result.excluded.extension, 1);
        assert_eq!(result.excluded.creation_date_out_of_range, 1);
        assert_eq!(result.excluded.creation_date_unparseable, 1);
        assert_eq!(result.excluded.size_out_of_range, 1);
    }

    #[test]
    fn dotted_path_creates_intermediate_objects() {
        let mut value = json!({ "business": null });
        set_dotted_path(&mut value, "business.owner.name", json!("Kim"));
        assert_eq!(value["business"]["owner"]["name"], "Kim");
    }

    #[test]
    fn cooperating_writer_documents_survive_flush() {
        let tmp = TempDir::new().unwrap();
        let config = store_config(tmp.path());

        // Process A opens the store and buffers a document.
        let mut ours = DocumentStore::open(&config).unwrap();

        // Process B flushes its own document meanwhile.
        let mut theirs = DocumentStore::open(&config).unwrap();
        theirs.add_batch(vec![record("theirs.pdf")]).unwrap();

        ours.add_batch(vec![record("ours.pdf")]).unwrap();

        let reopened = DocumentStore::open(&config).unwrap();
        assert!(reopened.get_document("theirs.pdf").is_some());
        assert!(reopened.get_document("ours.pdf").is_some());
    }
}
