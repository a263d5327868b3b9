//! External classification batch manager.
//!
//! Wraps the asynchronous bulk-classification job lifecycle of an
//! OpenAI-compatible batch endpoint, decoupled from the discovery and
//! processing cadence so thousands of documents can be classified cheaply in
//! one job:
//!
//! ```text
//! submitted ──▶ in_progress (polled) ──▶ completed │ failed │ expired
//! ```
//!
//! Only a completed job permits result retrieval. Every request carries a
//! stable custom-id; the custom-id→document-path map is persisted next to
//! the store (`batch_mapping_<batch_id>.json`, indexed by
//! `batch_job_index.json`) when the job is submitted, so results can be
//! joined back to documents arbitrarily later, including after restarts.
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx retry with exponential backoff (1s, 2s, 4s, ... capped
//! at 2^5); other 4xx fail immediately; network errors retry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::config::ClassificationConfig;
use crate::models::{DocumentRecord, JobStatus, ProcessingStatus};
use crate::persist;
use crate::store::DocumentStore;

/// Longest document preview shipped per request.
const PREVIEW_MAX_CHARS: usize = 4000;

/// Rough tokens-per-word ratio used for cost planning.
const TOKENS_PER_WORD: f64 = 4.0 / 3.0;

/// One buffered classification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRequest {
    /// Caller-assigned join key, unique per request.
    pub custom_id: String,
    pub document_path: String,
    pub preview: String,
    pub page_count: u64,
    pub word_count: u64,
}

/// Custom-id→path map persisted at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMapping {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    /// custom_id → document path.
    pub entries: BTreeMap<String, String>,
}

/// One classification joined back to a document path.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationOutcome {
    pub path: String,
    pub label: String,
    pub confidence: Option<f64>,
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPoll {
    pub status: JobStatus,
    pub actual_cost: Option<f64>,
}

pub struct BatchManager {
    config: ClassificationConfig,
    /// Directory holding mapping files and the job index (the store's dir).
    mapping_dir: PathBuf,
    pending: Vec<ClassificationRequest>,
}

impl BatchManager {
    pub fn new(config: &ClassificationConfig, mapping_dir: impl Into<PathBuf>) -> Self {
        Self {
            config: config.clone(),
            mapping_dir: mapping_dir.into(),
            pending: Vec::new(),
        }
    }

    // ============ Request collection ============

    /// Buffer one request for a later batch submission.
    pub fn collect_request(
        &mut self,
        doc: &DocumentRecord,
        preview: &str,
        page_count: u64,
        word_count: u64,
    ) -> &ClassificationRequest {
        let preview = if preview.len() > PREVIEW_MAX_CHARS {
            let mut cut = PREVIEW_MAX_CHARS;
            while !preview.is_char_boundary(cut) {
                cut -= 1;
            }
            &preview[..cut]
        } else {
            preview
        };

        self.pending.push(ClassificationRequest {
            custom_id: format!("doc-{}", Uuid::new_v4()),
            document_path: doc.path.clone(),
            preview: preview.to_string(),
            page_count,
            word_count,
        });
        self.pending.last().unwrap()
    }

    pub fn pending_requests(&self) -> &[ClassificationRequest] {
        &self.pending
    }

    /// Drain the buffered requests for submission.
    pub fn take_requests(&mut self) -> Vec<ClassificationRequest> {
        std::mem::take(&mut self.pending)
    }

    // ============ Cost planning ============

    /// Order-of-magnitude input cost in dollars for a set of requests.
    pub fn estimate_cost(&self, requests: &[ClassificationRequest]) -> f64 {
        let tokens: f64 = requests
            .iter()
            .map(|r| r.word_count as f64 * TOKENS_PER_WORD)
            .sum();
        (tokens / 1000.0) * self.config.price_per_1k_tokens
    }

    // ============ Job lifecycle ============

    /// Persist the custom-id map and submit one bulk job. Returns the
    /// external job id.
    ///
    /// The mapping file is written before the upload: if submission fails the
    /// orphan mapping is harmless, while the reverse order could leave a live
    /// job whose results can never be joined back.
    pub async fn create_batch(
        &self,
        requests: &[ClassificationRequest],
        batch_id: &str,
    ) -> Result<String> {
        if !self.config.is_enabled() {
            bail!("Classification provider is disabled. Set [classification] provider in config.");
        }
        if requests.is_empty() {
            bail!("Refusing to submit an empty classification batch");
        }

        let mapping_path = self.write_mapping(batch_id, requests)?;

        let model = self
            .config
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("classification.model required"))?;

        let body = json!({
            "model": model,
            "metadata": { "batch_id": batch_id },
            "requests": requests.iter().map(|r| json!({
                "custom_id": r.custom_id,
                "input": {
                    "preview": r.preview,
                    "page_count": r.page_count,
                    "word_count": r.word_count,
                },
            })).collect::<Vec<_>>(),
        });

        let url = format!("{}/batches", self.config.base_url.trim_end_matches('/'));
        let response = self.send_json(reqwest::Method::POST, &url, Some(&body)).await?;

        let job_id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Batch submission response missing job id"))?
            .to_string();

        self.record_job_mapping(&job_id, &mapping_path)?;
        Ok(job_id)
    }

    /// Poll the external service for a job's status.
    pub async fn check_status(&self, job_id: &str) -> Result<JobPoll> {
        let url = format!(
            "{}/batches/{}",
            self.config.base_url.trim_end_matches('/'),
            job_id
        );
        let response = self.send_json(reqwest::Method::GET, &url, None).await?;

        let status_str = response
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Status response missing status field"))?;
        let status = map_provider_status(status_str)
            .ok_or_else(|| anyhow::anyhow!("Unknown provider status: '{}'", status_str))?;

        let actual_cost = response
            .get("usage")
            .and_then(|u| u.get("total_cost"))
            .and_then(Value::as_f64)
            .filter(|c| c.is_finite());

        Ok(JobPoll {
            status,
            actual_cost,
        })
    }

    /// Fetch the raw result entries of a job. Errors unless the job is
    /// completed.
    pub async fn retrieve_results(&self, job_id: &str) -> Result<Vec<Value>> {
        let poll = self.check_status(job_id).await?;
        if poll.status != JobStatus::Completed {
            bail!(
                "Job {} is {:?}; results are only available once completed",
                job_id,
                poll.status
            );
        }

        let url = format!(
            "{}/batches/{}/results",
            self.config.base_url.trim_end_matches('/'),
            job_id
        );
        let response = self.send_json(reqwest::Method::GET, &url, None).await?;

        response
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Results response missing results array"))
    }

    /// Join raw result entries back to document paths through the persisted
    /// custom-id map. Malformed entries are logged and skipped; an entry for
    /// an unknown custom-id is skipped the same way.
    pub fn parse_results(&self, job_id: &str, raw: &[Value]) -> Result<Vec<ClassificationOutcome>> {
        let mapping = self.load_mapping_for_job(job_id)?;

        let mut outcomes = Vec::new();
        for entry in raw {
            let Some(custom_id) = entry.get("custom_id").and_then(Value::as_str) else {
                warn!(job_id, "result entry without custom_id; skipping");
                continue;
            };
            let Some(path) = mapping.entries.get(custom_id) else {
                warn!(job_id, custom_id, "result for unknown custom_id; skipping");
                continue;
            };
            let Some(label) = entry
                .get("result")
                .and_then(|r| r.get("label"))
                .and_then(Value::as_str)
            else {
                warn!(job_id, custom_id, "result entry without label; skipping");
                continue;
            };

            let confidence = entry
                .get("result")
                .and_then(|r| r.get("confidence"))
                .and_then(Value::as_f64)
                .filter(|c| c.is_finite());

            outcomes.push(ClassificationOutcome {
                path: path.clone(),
                label: label.to_string(),
                confidence,
            });
        }
        Ok(outcomes)
    }

    // ============ Mapping persistence ============

    pub fn mapping_path(&self, batch_id: &str) -> PathBuf {
        self.mapping_dir
            .join(format!("batch_mapping_{}.json", batch_id))
    }

    fn index_path(&self) -> PathBuf {
        self.mapping_dir.join("batch_job_index.json")
    }

    fn write_mapping(&self, batch_id: &str, requests: &[ClassificationRequest]) -> Result<PathBuf> {
        let mapping = BatchMapping {
            batch_id: batch_id.to_string(),
            created_at: Utc::now(),
            entries: requests
                .iter()
                .map(|r| (r.custom_id.clone(), r.document_path.clone()))
                .collect(),
        };
        let path = self.mapping_path(batch_id);
        persist::atomic_write_json(&path, &mapping)
            .with_context(|| format!("Failed to write mapping for batch '{}'", batch_id))?;
        Ok(path)
    }

    fn record_job_mapping(&self, job_id: &str, mapping_path: &Path) -> Result<()> {
        let mut index: BTreeMap<String, String> = persist::load_json(&self.index_path())
            .context("Failed to load batch job index")?
            .unwrap_or_default();

        let file_name = mapping_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        index.insert(job_id.to_string(), file_name);

        persist::atomic_write_json(&self.index_path(), &index)
            .context("Failed to write batch job index")?;
        Ok(())
    }

    fn load_mapping_for_job(&self, job_id: &str) -> Result<BatchMapping> {
        let index: BTreeMap<String, String> = persist::load_json(&self.index_path())
            .context("Failed to load batch job index")?
            .unwrap_or_default();

        let file_name = index
            .get(job_id)
            .ok_or_else(|| anyhow::anyhow!("No mapping recorded for job '{}'", job_id))?;
        let path = self.mapping_dir.join(file_name);

        persist::load_json(&path)
            .with_context(|| format!("Failed to read mapping {}", path.display()))?
            .ok_or_else(|| anyhow::anyhow!("Mapping file {} is missing", path.display()))
    }

    // ============ HTTP plumbing ============

    async fn send_json(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()?;

        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = client
                .request(method.clone(), url)
                .header("Authorization", format!("Bearer {}", api_key));
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Classification API error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Classification API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Classification request failed after retries")))
    }
}

/// Map the provider's status strings onto the job state machine.
fn map_provider_status(status: &str) -> Option<JobStatus> {
    match status {
        "validating" | "in_progress" | "finalizing" => Some(JobStatus::InProgress),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        "expired" => Some(JobStatus::Expired),
        "cancelling" | "cancelled" => Some(JobStatus::Cancelled),
        _ => None,
    }
}

/// Write a job's classifications onto the store's documents, then stamp the
/// job as applied. Re-applying a job is a no-op at the store level, so this
/// is safe to retry after a crash mid-apply.
pub fn apply_outcomes(
    store: &mut DocumentStore,
    job_id: &str,
    outcomes: &[ClassificationOutcome],
) -> Result<usize> {
    let mut applied = 0;
    for outcome in outcomes {
        if store.get_document(&outcome.path).is_none() {
            warn!(path = %outcome.path, "classification for unknown document; skipping");
            continue;
        }

        let updates = vec![
            ("classification.label".to_string(), json!(outcome.label)),
            (
                "classification.confidence".to_string(),
                json!(outcome.confidence),
            ),
            (
                "classification.classified_at".to_string(),
                json!(Utc::now()),
            ),
        ];
        store.update_document_metadata(&outcome.path, &updates, false)?;
        applied += 1;
    }

    store.flush_buffer()?;
    store.mark_batch_results_applied(job_id)?;
    Ok(applied)
}

/// Select the store's documents worth classifying: processed documents that
/// have no label yet.
pub fn unclassified_documents(store: &DocumentStore) -> Vec<&DocumentRecord> {
    store
        .documents()
        .iter()
        .filter(|d| d.status == ProcessingStatus::Processed && d.classification.label.is_none())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentDescriptor;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> BatchManager {
        BatchManager::new(&ClassificationConfig::default(), dir)
    }

    fn doc(path: &str) -> DocumentRecord {
        DocumentRecord::from_descriptor(DocumentDescriptor {
            path: path.into(),
            size: 10,
            modified_at: Utc::now(),
            content_hash: "h".into(),
            source_url: None,
            business: Value::Null,
        })
    }

    #[test]
    fn collected_requests_have_unique_custom_ids() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(tmp.path());

        m.collect_request(&doc("a.pdf"), "preview a", 2, 100);
        m.collect_request(&doc("b.pdf"), "preview b", 3, 200);

        let ids: Vec<_> = m.pending_requests().iter().map(|r| &r.custom_id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids[0].starts_with("doc-"));
    }

    #[test]
    fn long_previews_are_truncated() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(tmp.path());
        let long = "ä".repeat(PREVIEW_MAX_CHARS);

        let request = m.collect_request(&doc("a.pdf"), &long, 1, 1);
        assert!(request.preview.len() <= PREVIEW_MAX_CHARS);
        assert!(request.preview.chars().all(|c| c == 'ä'));
    }

    #[test]
    fn cost_estimate_scales_with_words() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(tmp.path());
        m.collect_request(&doc("a.pdf"), "p", 1, 750);

        let cost = m.estimate_cost(m.pending_requests());
        // 750 words ≈ 1000 tokens at the default $0.0005 per 1k.
        assert!((cost - 0.0005).abs() < 1e-9);
    }

    #[test]
    fn provider_status_mapping() {
        assert_eq!(map_provider_status("validating"), Some(JobStatus::InProgress));
        assert_eq!(map_provider_status("completed"), Some(JobStatus::Completed));
        assert_eq!(map_provider_status("expired"), Some(JobStatus::Expired));
        assert_eq!(map_provider_status("cancelled"), Some(JobStatus::Cancelled));
        assert_eq!(map_provider_status("weird"), None);
    }

    #[test]
    fn parse_results_joins_paths_and_skips_malformed() {
        let tmp = TempDir::new().unwrap();
        let mut m = manager(tmp.path());
        m.collect_request(&doc("a.pdf"), "p", 1, 10);
        m.collect_request(&doc("b.pdf"), "p", 1, 10);
        let requests = m.take_requests();

        let mapping_path = m.write_mapping("batch-7", &requests).unwrap();
        m.record_job_mapping("job-42", &mapping_path).unwrap();

        let raw = vec![
            json!({
                "custom_id": requests[0].custom_id,
                "result": { "label": "invoice", "confidence": 0.93 },
            }),
            // Malformed: no label.
            json!({ "custom_id": requests[1].custom_id, "result": {} }),
            // Malformed: no custom_id at all.
            json!({ "result": { "label": "contract" } }),
            // Unknown custom id.
            json!({ "custom_id": "doc-unknown", "result": { "label": "contract" } }),
        ];

        let outcomes = m.parse_results("job-42", &raw).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].path, "a.pdf");
        assert_eq!(outcomes[0].label, "invoice");
        assert_eq!(outcomes[0].confidence, Some(0.93));
    }

    #[test]
    fn parse_results_without_mapping_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let m = manager(tmp.path());
        assert!(m.parse_results("job-unknown", &[]).is_err());
    }

    #[test]
    fn apply_outcomes_updates_store_and_stamps_job() {
        use crate::config::StoreConfig;
        use crate::models::BatchJobRecord;

        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            output: tmp.path().join("store.json"),
            buffer_size: 100,
            update_threshold: 50,
        };
        let mut store = DocumentStore::open(&config).unwrap();
        store.add_batch(vec![doc("a.pdf")]).unwrap();

        let mut job = BatchJobRecord::new("job-1", 1, Some(0.1));
        job.status = JobStatus::Completed;
        store.save_batch_job(job).unwrap();

        let outcomes = vec![
            ClassificationOutcome {
                path: "a.pdf".into(),
                label: "invoice".into(),
                confidence: Some(0.8),
            },
            ClassificationOutcome {
                path: "ghost.pdf".into(),
                label: "contract".into(),
                confidence: None,
            },
        ];

        let applied = apply_outcomes(&mut store, "job-1", &outcomes).unwrap();
        assert_eq!(applied, 1);

        let record = store.get_document("a.pdf").unwrap();
        assert_eq!(record.classification.label.as_deref(), Some("invoice"));
        assert_eq!(record.classification.confidence, Some(0.8));
        assert!(store.batch_jobs()[0].results_applied);
    }
}
