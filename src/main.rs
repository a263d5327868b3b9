//! # docflow CLI
//!
//! The `docflow` binary drives the discovery and batch-processing pipeline.
//! It provides commands for enumerating a source into persistent batches,
//! processing those batches, inspecting on-disk state, and managing external
//! classification jobs.
//!
//! ## Usage
//!
//! ```bash
//! docflow --config ./config/docflow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docflow sources` | List configured connectors and their health |
//! | `docflow discover <collection>` | Enumerate the source into batches (resumable) |
//! | `docflow process <collection>` | Process every unprocessed batch |
//! | `docflow run <collection>` | Discovery then processing |
//! | `docflow status` | Summarize stores, batches, and jobs |
//! | `docflow classify submit` | Submit one bulk classification job |
//! | `docflow classify poll` | Poll pending jobs and record their status |
//! | `docflow classify apply <job>` | Retrieve and apply a completed job's results |
//!
//! ## Examples
//!
//! ```bash
//! # Enumerate a collection into 50-document batches
//! docflow discover deals --config ./config/docflow.toml
//!
//! # Resume processing after a crash — already-terminal batches are skipped
//! docflow process deals --config ./config/docflow.toml
//!
//! # Submit processed-but-unclassified documents as one bulk job
//! docflow classify submit --config ./config/docflow.toml
//!
//! # Later, possibly from a different process
//! docflow classify poll --wait
//! docflow classify apply batch_abc123
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use docflow::classify::{self, BatchManager};
use docflow::config;
use docflow::connector::ConnectorRegistry;
use docflow::discovery::DiscoveryTracker;
use docflow::ingest::{self, Interrupt};
use docflow::models::{BatchJobRecord, JobStatus};
use docflow::processor::NoopProcessor;
use docflow::progress::ProgressMode;
use docflow::status;
use docflow::store::DocumentStore;

/// docflow — a resumable document discovery and batch classification
/// pipeline for vector indexing.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docflow.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docflow",
    about = "docflow — a resumable document discovery and batch classification pipeline",
    version,
    long_about = "docflow enumerates large document collections from a source connector into \
    fixed-size persistent batches, processes them with durable per-batch and per-document \
    state, and classifies documents in bulk through an external LLM batch service. Every \
    stage resumes safely after process restarts, network failures, and rate limits."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docflow.toml")]
    config: PathBuf,

    /// Progress reporting on stderr: auto, off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List configured connectors and their health status.
    Sources,

    /// Enumerate a collection's source into persistent batches.
    ///
    /// Resumes from the stored cursor if a previous run was interrupted.
    /// Each `batch_size` documents become one queue file plus one batch
    /// state record; discovered documents land in the document store.
    Discover {
        /// Collection to enumerate (a connector instance name from config).
        collection: String,

        /// Ignore saved discovery progress and start a fresh enumeration.
        /// Documents already in the store are not re-batched.
        #[arg(long)]
        full: bool,
    },

    /// Process every unprocessed batch of a collection, lowest id first.
    ///
    /// Records success/failure counts per batch and per document. Once all
    /// batches are terminal, the collection is marked processing-complete.
    Process {
        /// Collection whose batches to process.
        collection: String,
    },

    /// Run discovery and processing in sequence.
    Run {
        /// Collection to discover and process.
        collection: String,

        /// Ignore saved discovery progress and start a fresh enumeration.
        #[arg(long)]
        full: bool,
    },

    /// Summarize the document store, batch progress, and classification jobs.
    Status,

    /// Manage external bulk classification jobs.
    Classify {
        #[command(subcommand)]
        action: ClassifyAction,
    },
}

/// Classification job subcommands.
#[derive(Subcommand)]
enum ClassifyAction {
    /// Submit processed-but-unclassified documents as one bulk job.
    Submit {
        /// Maximum number of documents to include.
        #[arg(long)]
        limit: Option<usize>,

        /// Show document count and estimated cost without submitting.
        #[arg(long)]
        dry_run: bool,
    },

    /// Poll pending jobs and record their current status.
    Poll {
        /// Poll one specific job instead of all pending ones.
        job_id: Option<String>,

        /// Keep polling at the configured interval until the job is terminal.
        #[arg(long)]
        wait: bool,
    },

    /// Retrieve a completed job's results and apply them to the store.
    Apply {
        /// External job id, as printed by `classify submit`.
        job_id: String,
    },

    /// List all recorded classification jobs.
    Jobs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let reporter = progress_mode(&cli.progress)?.reporter();

    let interrupt = Interrupt::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.raise();
            }
        });
    }

    match cli.command {
        Commands::Sources => {
            status::run_sources(&cfg)?;
        }
        Commands::Discover { collection, full } => {
            let registry = ConnectorRegistry::from_config(&cfg);
            let connector = registry
                .find(&collection)
                .ok_or_else(|| anyhow::anyhow!("No connector configured for '{}'", collection))?;

            if full {
                reset_discovery(&cfg, &collection)?;
            }

            let mut store = DocumentStore::open(&cfg.store)?;
            let summary =
                ingest::run_discovery(&cfg, connector, &mut store, reporter.as_ref(), &interrupt)
                    .await?;

            println!("discover {}", collection);
            if summary.already_complete {
                println!("  already complete");
            }
            println!("  documents discovered: {}", summary.discovered);
            println!("  batches created: {}", summary.batches_created);
            println!("ok");
        }
        Commands::Process { collection } => {
            let registry = ConnectorRegistry::from_config(&cfg);
            let source_path = registry
                .find(&collection)
                .map(|c| c.source_path())
                .unwrap_or_default();

            let mut store = DocumentStore::open(&cfg.store)?;
            let summary = ingest::run_processing(
                &cfg,
                &collection,
                &source_path,
                &NoopProcessor,
                &mut store,
                reporter.as_ref(),
                &interrupt,
            )
            .await?;

            print_processing_summary(&collection, &summary);
        }
        Commands::Run { collection, full } => {
            let registry = ConnectorRegistry::from_config(&cfg);
            let connector = registry
                .find(&collection)
                .ok_or_else(|| anyhow::anyhow!("No connector configured for '{}'", collection))?;

            if full {
                reset_discovery(&cfg, &collection)?;
            }

            let mut store = DocumentStore::open(&cfg.store)?;
            let (discovery, processing) = ingest::run_pipeline(
                &cfg,
                connector,
                &NoopProcessor,
                &mut store,
                reporter.as_ref(),
                &interrupt,
            )
            .await?;

            println!("run {}", collection);
            println!("  documents discovered: {}", discovery.discovered);
            println!("  batches created: {}", discovery.batches_created);
            print_processing_summary(&collection, &processing);
        }
        Commands::Status => {
            status::run_status(&cfg)?;
        }
        Commands::Classify { action } => match action {
            ClassifyAction::Submit { limit, dry_run } => {
                run_classify_submit(&cfg, limit, dry_run).await?;
            }
            ClassifyAction::Poll { job_id, wait } => {
                run_classify_poll(&cfg, job_id, wait, &interrupt).await?;
            }
            ClassifyAction::Apply { job_id } => {
                run_classify_apply(&cfg, &job_id).await?;
            }
            ClassifyAction::Jobs => {
                let store = DocumentStore::open(&cfg.store)?;
                println!("classification jobs: {}", store.batch_jobs().len());
                for job in store.batch_jobs() {
                    println!(
                        "  {}  {:?}  {} docs  applied={}",
                        job.job_id, job.status, job.document_count, job.results_applied
                    );
                }
            }
        },
    }

    Ok(())
}

fn progress_mode(raw: &str) -> anyhow::Result<ProgressMode> {
    match raw {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => anyhow::bail!("Unknown progress mode: '{}'", other),
    }
}

/// Drop the saved discovery snapshot so enumeration starts from the first
/// page. Already-stored documents stay deduplicated by path.
fn reset_discovery(cfg: &config::Config, collection: &str) -> anyhow::Result<()> {
    let snapshot = DiscoveryTracker::snapshot_path(&cfg.cache.discovery_dir(), collection);
    match std::fs::remove_file(&snapshot) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn print_processing_summary(collection: &str, summary: &ingest::ProcessingSummary) {
    println!("process {}", collection);
    println!("  batches processed: {}", summary.batches_processed);
    println!("  batches failed: {}", summary.batches_failed);
    println!("  documents processed: {}", summary.documents_processed);
    println!("  documents failed: {}", summary.documents_failed);
    if summary.documents_skipped > 0 {
        println!("  documents skipped: {}", summary.documents_skipped);
    }
    println!("  chunks created: {}", summary.chunks_created);
    if summary.processing_complete {
        println!("  processing complete");
    }
    println!("ok");
}

async fn run_classify_submit(
    cfg: &config::Config,
    limit: Option<usize>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut store = DocumentStore::open(&cfg.store)?;
    let mut manager = BatchManager::new(&cfg.classification, cfg.store.output_dir());

    let candidates = classify::unclassified_documents(&store);
    let selected: Vec<_> = match limit {
        Some(limit) => candidates.into_iter().take(limit).collect(),
        None => candidates,
    };

    if selected.is_empty() {
        println!("classify submit");
        println!("  no unclassified documents");
        return Ok(());
    }

    for doc in &selected {
        // The content pipeline owns real text; for planning we approximate
        // from file size and ship path + business metadata as the preview.
        let preview = format!("{}\n{}", doc.path, doc.business);
        let word_count = (doc.size / 6).max(1);
        let page_count = doc.size / 3000 + 1;
        manager.collect_request(doc, &preview, page_count, word_count);
    }

    let requests = manager.take_requests();
    let estimated = manager.estimate_cost(&requests);

    if dry_run {
        println!("classify submit (dry-run)");
        println!("  documents: {}", requests.len());
        println!("  estimated cost: ${:.4}", estimated);
        return Ok(());
    }

    let batch_id = format!("batch_{}", Uuid::new_v4().simple());
    let job_id = manager.create_batch(&requests, &batch_id).await?;
    store.save_batch_job(BatchJobRecord::new(
        job_id.clone(),
        requests.len() as u64,
        Some(estimated),
    ))?;

    println!("classify submit");
    println!("  documents: {}", requests.len());
    println!("  estimated cost: ${:.4}", estimated);
    println!("  job id: {}", job_id);
    println!("ok");
    Ok(())
}

async fn run_classify_poll(
    cfg: &config::Config,
    job_id: Option<String>,
    wait: bool,
    interrupt: &Interrupt,
) -> anyhow::Result<()> {
    let mut store = DocumentStore::open(&cfg.store)?;
    let manager = BatchManager::new(&cfg.classification, cfg.store.output_dir());

    let mut targets: Vec<String> = match job_id {
        Some(id) => vec![id],
        None => store
            .get_pending_batch_jobs()
            .iter()
            .map(|j| j.job_id.clone())
            .collect(),
    };

    if targets.is_empty() {
        println!("classify poll");
        println!("  no pending jobs");
        return Ok(());
    }

    println!("classify poll");
    loop {
        let mut still_pending = Vec::new();
        for id in &targets {
            let poll = manager.check_status(id).await?;
            store.update_batch_job_status(id, poll.status, poll.actual_cost)?;
            println!("  {}  {:?}", id, poll.status);
            if !poll.status.is_terminal() {
                still_pending.push(id.clone());
            }
        }

        targets = still_pending;
        if !wait || targets.is_empty() || interrupt.is_raised() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(
            cfg.classification.poll_interval_secs,
        ))
        .await;
    }
    println!("ok");
    Ok(())
}

async fn run_classify_apply(cfg: &config::Config, job_id: &str) -> anyhow::Result<()> {
    let mut store = DocumentStore::open(&cfg.store)?;
    let manager = BatchManager::new(&cfg.classification, cfg.store.output_dir());

    let raw = manager.retrieve_results(job_id).await?;
    let outcomes = manager.parse_results(job_id, &raw)?;

    store.update_batch_job_status(job_id, JobStatus::Completed, None)?;
    let applied = classify::apply_outcomes(&mut store, job_id, &outcomes)?;

    println!("classify apply {}", job_id);
    println!("  results retrieved: {}", raw.len());
    println!("  classifications applied: {}", applied);
    println!("ok");
    Ok(())
}
