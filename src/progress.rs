//! Pipeline progress reporting.
//!
//! Reports observable progress during `docflow discover` and `docflow
//! process` so users see what is being enumerated, how many batches exist,
//! and how far processing has come. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.
//!
//! The reporter is constructed once at startup and passed explicitly into
//! the pipeline; components never reach into ambient global state for it.

use std::io::Write;

/// A single progress event from the pipeline.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// Discovery is enumerating the source.
    Discovering {
        collection: String,
        discovered: u64,
        estimated_total: Option<u64>,
    },
    /// One batch was cut and persisted to the queue.
    BatchCreated {
        collection: String,
        batch_id: u64,
        documents: usize,
    },
    /// One batch finished processing.
    BatchProcessed {
        collection: String,
        batch_id: u64,
        success: u64,
        failure: u64,
    },
    /// A classification job changed state.
    JobStatus {
        job_id: String,
        status: String,
    },
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: PipelineEvent);
}

/// Human-friendly progress: "discover deals  1,234 / ~5,000 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: PipelineEvent) {
        let line = match &event {
            PipelineEvent::Discovering {
                collection,
                discovered,
                estimated_total,
            } => match estimated_total {
                Some(total) => format!(
                    "discover {}  {} / ~{} documents\n",
                    collection,
                    format_number(*discovered),
                    format_number(*total)
                ),
                None => format!(
                    "discover {}  {} documents\n",
                    collection,
                    format_number(*discovered)
                ),
            },
            PipelineEvent::BatchCreated {
                collection,
                batch_id,
                documents,
            } => format!(
                "discover {}  batch {} queued ({} documents)\n",
                collection, batch_id, documents
            ),
            PipelineEvent::BatchProcessed {
                collection,
                batch_id,
                success,
                failure,
            } => format!(
                "process {}  batch {} done ({} ok, {} failed)\n",
                collection, batch_id, success, failure
            ),
            PipelineEvent::JobStatus { job_id, status } => {
                format!("classify  job {} is {}\n", job_id, status)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: PipelineEvent) {
        let obj = match &event {
            PipelineEvent::Discovering {
                collection,
                discovered,
                estimated_total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "collection": collection,
                "discovered": discovered,
                "estimated_total": estimated_total,
            }),
            PipelineEvent::BatchCreated {
                collection,
                batch_id,
                documents,
            } => serde_json::json!({
                "event": "progress",
                "phase": "batch_created",
                "collection": collection,
                "batch_id": batch_id,
                "documents": documents,
            }),
            PipelineEvent::BatchProcessed {
                collection,
                batch_id,
                success,
                failure,
            } => serde_json::json!({
                "event": "progress",
                "phase": "batch_processed",
                "collection": collection,
                "batch_id": batch_id,
                "success": success,
                "failure": failure,
            }),
            PipelineEvent::JobStatus { job_id, status } => serde_json::json!({
                "event": "progress",
                "phase": "job_status",
                "job_id": job_id,
                "status": status,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: PipelineEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller passes it into the pipeline.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
