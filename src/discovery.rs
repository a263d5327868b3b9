//! Discovery progress tracking.
//!
//! One [`DiscoveryTracker`] drives one resumable enumeration of a collection.
//! It persists a [`DiscoveryProgress`] snapshot to
//! `cache/discovery/progressive_<collection>.json` on every page boundary and
//! every N documents, so a crashed run resumes from the stored cursor instead
//! of re-enumerating the source.
//!
//! Enumeration is at-least-once: a crash between "document yielded" and
//! "cursor persisted" re-yields up to one page on resume. Downstream
//! consumers de-duplicate by path.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::connector::SourceConnector;
use crate::models::DiscoveryProgress;
use crate::persist;

/// Errors kept per progress record before the oldest are dropped.
const MAX_RECORDED_ERRORS: usize = 20;

pub struct DiscoveryTracker {
    path: PathBuf,
    progress: DiscoveryProgress,
    /// Persist the cursor every N documents, besides page boundaries.
    flush_every: usize,
    docs_since_flush: usize,
}

impl DiscoveryTracker {
    /// Snapshot path for a collection.
    pub fn snapshot_path(discovery_dir: &Path, collection: &str) -> PathBuf {
        discovery_dir.join(format!("progressive_{}.json", collection))
    }

    /// Load saved progress for the collection, or begin a fresh run.
    ///
    /// Resumption requires the stored source path to match: a snapshot from a
    /// different source is an operator error, not something to silently
    /// overwrite.
    pub fn start_or_resume(
        discovery_dir: &Path,
        collection: &str,
        source_path: &str,
        flush_every: usize,
    ) -> Result<Self> {
        let path = Self::snapshot_path(discovery_dir, collection);

        let progress = match persist::load_json::<DiscoveryProgress>(&path)
            .with_context(|| format!("Failed to load discovery progress for '{}'", collection))?
        {
            Some(mut saved) => {
                if saved.source_path != source_path {
                    bail!(
                        "Discovery progress for '{}' records source '{}', not '{}'. \
                         Clear {} to start over.",
                        collection,
                        saved.source_path,
                        source_path,
                        path.display()
                    );
                }
                saved.enforce_invariants();
                debug!(
                    collection,
                    cursor = ?saved.cursor,
                    discovered = saved.total_discovered,
                    "resuming discovery"
                );
                saved
            }
            None => DiscoveryProgress::new(source_path),
        };

        Ok(Self {
            path,
            progress,
            flush_every: flush_every.max(1),
            docs_since_flush: 0,
        })
    }

    pub fn progress(&self) -> &DiscoveryProgress {
        &self.progress
    }

    pub fn is_complete(&self) -> bool {
        self.progress.discovery_complete
    }

    pub fn cursor(&self) -> Option<&str> {
        self.progress.cursor.as_deref()
    }

    /// Record yielded documents; persists every `flush_every` documents.
    pub fn record_documents(&mut self, count: usize, last_path: Option<&str>) -> Result<()> {
        self.progress.total_discovered += count as u64;
        if let Some(path) = last_path {
            self.progress.last_discovered_path = Some(path.to_string());
        }

        self.docs_since_flush += count;
        if self.docs_since_flush >= self.flush_every {
            self.save()?;
        }
        Ok(())
    }

    /// Page boundary: store the connector's new cursor and persist.
    pub fn advance(&mut self, cursor: Option<String>) -> Result<()> {
        self.progress.cursor = cursor;
        self.save()
    }

    /// Count one batch handed to the queue.
    pub fn record_batch_created(&mut self) -> Result<()> {
        self.progress.total_batches_created += 1;
        self.save()
    }

    /// Best-effort total estimate for percentage reporting. Never fatal: an
    /// estimation failure is logged and leaves the estimate unset.
    pub async fn estimate_total(&mut self, connector: &dyn SourceConnector) {
        if !connector.capabilities().total_estimate {
            return;
        }
        match connector.estimate_total().await {
            Ok(estimate) => self.progress.estimated_total = estimate,
            Err(e) => {
                warn!(error = %e, "total estimation failed; continuing without");
            }
        }
    }

    /// Record a discovery error and flush the last-known-good cursor. The
    /// caller re-raises the underlying error after this returns.
    pub fn record_error(&mut self, error: &str) {
        self.progress.errors.push(error.to_string());
        if self.progress.errors.len() > MAX_RECORDED_ERRORS {
            let excess = self.progress.errors.len() - MAX_RECORDED_ERRORS;
            self.progress.errors.drain(..excess);
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist discovery progress after error");
        }
    }

    /// Source exhausted: stamp completion and clear the cursor.
    pub fn complete(&mut self) -> Result<()> {
        self.progress.discovery_complete = true;
        self.progress.cursor = None;
        self.save()
    }

    fn save(&mut self) -> Result<()> {
        self.progress.updated_at = Utc::now();
        self.docs_since_flush = 0;
        persist::atomic_write_json(&self.path, &self.progress)
            .with_context(|| "Failed to persist discovery progress")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker(dir: &Path) -> DiscoveryTracker {
        DiscoveryTracker::start_or_resume(dir, "deals", "/data/deals", 25).unwrap()
    }

    #[test]
    fn fresh_run_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let t = tracker(tmp.path());
        assert_eq!(t.cursor(), None);
        assert!(!t.is_complete());
        assert_eq!(t.progress().total_discovered, 0);
    }

    #[test]
    fn advance_persists_cursor_for_resume() {
        let tmp = TempDir::new().unwrap();
        let mut t = tracker(tmp.path());
        t.record_documents(10, Some("deals/a.pdf")).unwrap();
        t.advance(Some("deals/a.pdf".into())).unwrap();
        drop(t);

        let resumed = tracker(tmp.path());
        assert_eq!(resumed.cursor(), Some("deals/a.pdf"));
        assert_eq!(resumed.progress().total_discovered, 10);
        assert_eq!(
            resumed.progress().last_discovered_path.as_deref(),
            Some("deals/a.pdf")
        );
    }

    #[test]
    fn document_counter_flushes_every_n() {
        let tmp = TempDir::new().unwrap();
        let path = DiscoveryTracker::snapshot_path(tmp.path(), "deals");
        let mut t = tracker(tmp.path());

        t.record_documents(24, Some("x")).unwrap();
        assert!(!path.exists(), "below threshold, nothing persisted");

        t.record_documents(1, Some("y")).unwrap();
        assert!(path.exists(), "threshold reached, snapshot persisted");
    }

    #[test]
    fn complete_clears_cursor() {
        let tmp = TempDir::new().unwrap();
        let mut t = tracker(tmp.path());
        t.advance(Some("mid".into())).unwrap();
        t.complete().unwrap();
        drop(t);

        let resumed = tracker(tmp.path());
        assert!(resumed.is_complete());
        assert_eq!(resumed.cursor(), None);
    }

    #[test]
    fn source_mismatch_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut t = tracker(tmp.path());
        t.advance(Some("mid".into())).unwrap();
        drop(t);

        let result = DiscoveryTracker::start_or_resume(tmp.path(), "deals", "/other/source", 25);
        assert!(result.is_err());
    }

    #[test]
    fn error_log_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let mut t = tracker(tmp.path());
        for i in 0..30 {
            t.record_error(&format!("error {}", i));
        }
        assert_eq!(t.progress().errors.len(), MAX_RECORDED_ERRORS);
        assert_eq!(t.progress().errors.last().unwrap(), "error 29");
    }
}
