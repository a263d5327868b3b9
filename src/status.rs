//! Pipeline status overview.
//!
//! Provides a quick summary of what's on disk: document counts, per-collection
//! batch progress, queue usage, and classification job bookkeeping. Used by
//! `docflow status` to give confidence that discovery and processing are
//! working as expected.

use anyhow::Result;

use crate::batch_queue::BatchQueue;
use crate::batch_state::BatchStateStore;
use crate::config::Config;
use crate::models::JobStatus;
use crate::store::DocumentStore;

/// Run the status command: read the stores and print a summary.
pub fn run_status(config: &Config) -> Result<()> {
    let store = DocumentStore::open(&config.store)?;
    let store_size = std::fs::metadata(&config.store.output)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("docflow — Pipeline Status");
    println!("=========================");
    println!();
    println!("  Store:       {}", config.store.output.display());
    println!("  Size:        {}", format_bytes(store_size));
    println!();
    println!("  Documents:   {}", store.progress().total_documents);
    println!("  Processed:   {}", store.progress().processed_documents);
    println!("  Failed:      {}", store.progress().failed_documents);
    println!(
        "  Discovery:   {}",
        if store.progress().discovery_complete {
            "complete"
        } else {
            "in progress"
        }
    );

    // Per-collection batch breakdown, from the state files actually on disk.
    let collections = list_collections(config)?;
    if !collections.is_empty() {
        println!();
        println!("  By collection:");
        println!(
            "  {:<20} {:>8} {:>10} {:>8} {:>8}   {}",
            "COLLECTION", "BATCHES", "PROCESSED", "FAILED", "QUEUE", "PROGRESS"
        );
        println!("  {}", "-".repeat(76));

        for collection in &collections {
            let state = BatchStateStore::load_or_create(
                &config.cache.batches_dir(),
                collection,
                "",
                config.discovery.batch_size,
            )?;
            let summary = state.get_progress_summary();
            let queue = BatchQueue::new(config.cache.batches_dir(), collection.as_str());
            let queue_status = queue.get_queue_status()?;

            println!(
                "  {:<20} {:>8} {:>10} {:>8} {:>8}   {:>5.1}%{}",
                collection,
                summary.total_batches,
                summary.processed_batches,
                summary.failed_batches,
                format_bytes(queue_status.disk_bytes),
                summary.progress_percentage,
                if summary.processing_complete {
                    "  (complete)"
                } else {
                    ""
                }
            );
        }
    }

    // Classification jobs.
    let jobs = store.batch_jobs();
    if !jobs.is_empty() {
        println!();
        println!("  Classification jobs:");
        println!(
            "  {:<28} {:<12} {:>6} {:>9} {:>9}   {}",
            "JOB", "STATUS", "DOCS", "EST", "ACTUAL", "SUBMITTED"
        );
        println!("  {}", "-".repeat(76));

        for job in jobs {
            println!(
                "  {:<28} {:<12} {:>6} {:>9} {:>9}   {}{}",
                job.job_id,
                format_job_status(job.status),
                job.document_count,
                format_cost(job.estimated_cost),
                format_cost(job.actual_cost),
                format_ts_relative(job.submitted_at.timestamp()),
                if job.results_applied { "  (applied)" } else { "" }
            );
        }
    }

    println!();
    Ok(())
}

/// List configured connectors and their health status.
pub fn run_sources(config: &Config) -> Result<()> {
    println!("{:<20} {:<12} {:<10} ROOT", "COLLECTION", "TYPE", "STATUS");

    if config.connectors.filesystem.is_empty() {
        println!("(no connectors configured)");
        return Ok(());
    }

    for (name, fs_config) in &config.connectors.filesystem {
        let status = if fs_config.root.exists() {
            "OK"
        } else {
            "MISSING"
        };
        println!(
            "{:<20} {:<12} {:<10} {}",
            name,
            "filesystem",
            status,
            fs_config.root.display()
        );
    }
    Ok(())
}

/// Collections with a batch state file on disk.
fn list_collections(config: &Config) -> Result<Vec<String>> {
    let dir = config.cache.batches_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut collections = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(collection) = name
            .strip_prefix("batch_state_")
            .and_then(|s| s.strip_suffix(".json"))
        {
            collections.push(collection.to_string());
        }
    }
    collections.sort();
    Ok(collections)
}

fn format_job_status(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Submitted => "submitted",
        JobStatus::InProgress => "in progress",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Expired => "expired",
        JobStatus::Cancelled => "cancelled",
    }
}

fn format_cost(cost: Option<f64>) -> String {
    match cost {
        Some(c) => format!("${:.4}", c),
        None => "-".to_string(),
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn cost_formatting() {
        assert_eq!(format_cost(Some(0.1234)), "$0.1234");
        assert_eq!(format_cost(None), "-");
    }
}
