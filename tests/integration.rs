use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docflow_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docflow");
    path
}

/// Scaffold a workspace: config file, cache dir, and `count` source files
/// under `files/`.
fn setup_test_env(count: usize, batch_size: usize) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    for i in 0..count {
        fs::write(
            files_dir.join(format!("doc_{:04}.md", i)),
            format!("# Document {}\n\nQuarterly report contents number {}.\n", i, i),
        )
        .unwrap();
    }

    let config_content = format!(
        r#"[store]
output = "{root}/data/discovered.json"
buffer_size = 100
update_threshold = 50

[discovery]
batch_size = {batch_size}
page_size = 40
cursor_flush_every = 25

[cache]
dir = "{root}/cache"

[connectors.filesystem.deals]
root = "{root}/files"
include_globs = ["**/*.md"]
exclude_globs = []
follow_symlinks = false
"#,
        root = root.display(),
        batch_size = batch_size
    );

    let config_path = config_dir.join("docflow.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docflow(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docflow_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docflow binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_sources_lists_connectors() {
    let (_tmp, config_path) = setup_test_env(3, 50);

    let (stdout, stderr, success) = run_docflow(&config_path, &["sources"]);
    assert!(success, "sources failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("deals"));
    assert!(stdout.contains("OK"));
}

#[test]
fn test_discover_cuts_expected_batches() {
    let (tmp, config_path) = setup_test_env(120, 50);

    let (stdout, stderr, success) = run_docflow(&config_path, &["discover", "deals"]);
    assert!(success, "discover failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents discovered: 120"));
    assert!(stdout.contains("batches created: 3"));
    assert!(stdout.contains("ok"));

    // 120 documents at batch_size 50 → 50, 50, 20 on disk.
    let batches_dir = tmp.path().join("cache/batches");
    let mut sizes = Vec::new();
    for id in 1..=3u64 {
        let raw = fs::read_to_string(batches_dir.join(format!("batch_deals_{}.json", id))).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        sizes.push(parsed["documents"].as_array().unwrap().len());
    }
    assert_eq!(sizes, vec![50, 50, 20]);
}

#[test]
fn test_discover_is_idempotent() {
    let (tmp, config_path) = setup_test_env(10, 4);

    let (_, _, success) = run_docflow(&config_path, &["discover", "deals"]);
    assert!(success, "first discover failed");

    let (stdout, _, success) = run_docflow(&config_path, &["discover", "deals"]);
    assert!(success, "second discover failed");
    assert!(stdout.contains("already complete"));

    let batches_dir = tmp.path().join("cache/batches");
    let batch_files = fs::read_dir(&batches_dir)
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name().to_string_lossy().to_string();
            name.starts_with("batch_deals_") && !name.contains("marker")
        })
        .count();
    assert_eq!(batch_files, 3, "re-discovery must not add batches");
}

#[test]
fn test_run_reaches_full_completion() {
    let (tmp, config_path) = setup_test_env(120, 50);

    let (stdout, stderr, success) = run_docflow(&config_path, &["run", "deals"]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("batches processed: 3"));
    assert!(stdout.contains("documents processed: 120"));
    assert!(stdout.contains("processing complete"));

    // Batch state records full completion.
    let state_raw =
        fs::read_to_string(tmp.path().join("cache/batches/batch_state_deals.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state_raw).unwrap();
    assert_eq!(state["processing_complete"], true);
    assert_eq!(state["total_batches"], 3);
    assert_eq!(state["total_documents"], 120);
}

#[test]
fn test_process_resumes_and_status_reports() {
    let (_tmp, config_path) = setup_test_env(20, 8);

    run_docflow(&config_path, &["discover", "deals"]);
    let (stdout, stderr, success) = run_docflow(&config_path, &["process", "deals"]);
    assert!(success, "process failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("batches processed: 3"));

    // A second process run has nothing left to do but stays complete.
    let (stdout, _, success) = run_docflow(&config_path, &["process", "deals"]);
    assert!(success);
    assert!(stdout.contains("batches processed: 0"));
    assert!(stdout.contains("processing complete"));

    let (stdout, _, success) = run_docflow(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("Documents:   20"));
    assert!(stdout.contains("Processed:   20"));
    assert!(stdout.contains("100.0%"));
    assert!(stdout.contains("(complete)"));
}

#[test]
fn test_store_file_is_valid_json_after_run() {
    let (tmp, config_path) = setup_test_env(7, 3);

    run_docflow(&config_path, &["run", "deals"]);

    let raw = fs::read_to_string(tmp.path().join("data/discovered.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["documents"].as_array().unwrap().len(), 7);
    assert_eq!(parsed["metadata"]["schema_version"], 3);
    assert_eq!(parsed["progress"]["discovery_complete"], true);

    // Session snapshot sits next to the store.
    assert!(tmp.path().join("data/discovered.progress.json").exists());
}

#[test]
fn test_later_files_surface_as_new_batches() {
    let (tmp, config_path) = setup_test_env(6, 3);

    let (_, _, success) = run_docflow(&config_path, &["run", "deals"]);
    assert!(success);

    // New files arrive; a forced re-discovery queues only them.
    for i in 100..103 {
        fs::write(
            tmp.path().join(format!("files/doc_{:04}.md", i)),
            "late arrival",
        )
        .unwrap();
    }

    let (stdout, stderr, success) = run_docflow(&config_path, &["run", "deals", "--full"]);
    assert!(success, "rerun failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents discovered: 3"));
    assert!(stdout.contains("batches created: 1"));
    assert!(stdout.contains("processing complete"));

    let state_raw =
        fs::read_to_string(tmp.path().join("cache/batches/batch_state_deals.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state_raw).unwrap();
    assert_eq!(state["total_batches"], 3);
    assert_eq!(state["total_documents"], 9);
    assert_eq!(state["processing_complete"], true);
}

#[test]
fn test_classify_submit_dry_run_estimates() {
    let (_tmp, config_path) = setup_test_env(5, 5);

    run_docflow(&config_path, &["run", "deals"]);

    let (stdout, stderr, success) =
        run_docflow(&config_path, &["classify", "submit", "--dry-run"]);
    assert!(success, "dry-run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("classify submit (dry-run)"));
    assert!(stdout.contains("documents: 5"));
    assert!(stdout.contains("estimated cost: $"));
}

#[test]
fn test_classify_jobs_empty_initially() {
    let (_tmp, config_path) = setup_test_env(2, 2);

    run_docflow(&config_path, &["discover", "deals"]);
    let (stdout, _, success) = run_docflow(&config_path, &["classify", "jobs"]);
    assert!(success);
    assert!(stdout.contains("classification jobs: 0"));
}
