use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Path of the Discovery Document Store file (`<output>.json`).
    pub output: PathBuf,
    /// Buffered documents before an automatic flush.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Deferred metadata updates before a forced disk write.
    #[serde(default = "default_update_threshold")]
    pub update_threshold: usize,
}

fn default_buffer_size() -> usize {
    100
}
fn default_update_threshold() -> usize {
    50
}

impl StoreConfig {
    /// Lock sentinel next to the store file (`<output>.lock`).
    pub fn lock_path(&self) -> PathBuf {
        self.output.with_extension("lock")
    }

    /// Lightweight session snapshot (`<output>.progress.json`).
    pub fn progress_path(&self) -> PathBuf {
        self.output.with_extension("progress.json")
    }

    /// Directory holding the store file; job mapping files live beside it.
    pub fn output_dir(&self) -> PathBuf {
        self.output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Documents per batch written to the queue.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Documents requested per connector page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Persist the cursor every N documents in addition to page boundaries.
    #[serde(default = "default_cursor_flush_every")]
    pub cursor_flush_every: usize,
    /// chrono format of the business "creation date" field (locale-specific,
    /// e.g. `%d.%m.%Y` for `31.12.2024`).
    #[serde(default = "default_creation_date_format")]
    pub creation_date_format: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            cursor_flush_every: default_cursor_flush_every(),
            creation_date_format: default_creation_date_format(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_page_size() -> usize {
    100
}
fn default_cursor_flush_every() -> usize {
    25
}
fn default_creation_date_format() -> String {
    "%d.%m.%Y".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

impl CacheConfig {
    /// Batch queue and batch state files (`cache/batches/`).
    pub fn batches_dir(&self) -> PathBuf {
        self.dir.join("batches")
    }

    /// Discovery progress snapshots (`cache/discovery/`).
    pub fn discovery_dir(&self) -> PathBuf {
        self.dir.join("discovery")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassificationConfig {
    /// `disabled` or `openai`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Planning rate for `estimate_cost`, in dollars per 1k input tokens.
    #[serde(default = "default_price_per_1k_tokens")]
    pub price_per_1k_tokens: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            poll_interval_secs: default_poll_interval_secs(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            price_per_1k_tokens: default_price_per_1k_tokens(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_price_per_1k_tokens() -> f64 {
    0.0005
}

impl ClassificationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    /// Filesystem connector instances, keyed by collection name.
    #[serde(default)]
    pub filesystem: BTreeMap<String, FilesystemConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
        "**/*.xlsx".to_string(),
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
    ]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate store
    if config.store.buffer_size == 0 {
        anyhow::bail!("store.buffer_size must be > 0");
    }
    if config.store.update_threshold == 0 {
        anyhow::bail!("store.update_threshold must be > 0");
    }

    // Validate discovery
    if config.discovery.batch_size == 0 {
        anyhow::bail!("discovery.batch_size must be > 0");
    }
    if config.discovery.page_size == 0 {
        anyhow::bail!("discovery.page_size must be > 0");
    }
    if config.discovery.cursor_flush_every == 0 {
        anyhow::bail!("discovery.cursor_flush_every must be > 0");
    }
    if config.discovery.creation_date_format.is_empty() {
        anyhow::bail!("discovery.creation_date_format must not be empty");
    }

    // Validate classification
    if config.classification.is_enabled() && config.classification.model.is_none() {
        anyhow::bail!(
            "classification.model must be specified when provider is '{}'",
            config.classification.provider
        );
    }

    match config.classification.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown classification provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str(
            r#"
[store]
output = "data/discovered.json"
"#,
        )
        .unwrap();
        assert_eq!(config.store.buffer_size, 100);
        assert_eq!(config.store.update_threshold, 50);
        assert_eq!(config.discovery.batch_size, 50);
        assert_eq!(config.discovery.cursor_flush_every, 25);
        assert_eq!(config.classification.provider, "disabled");
        assert!(config.connectors.filesystem.is_empty());
    }

    #[test]
    fn derived_store_paths() {
        let store = StoreConfig {
            output: PathBuf::from("data/discovered.json"),
            buffer_size: 100,
            update_threshold: 50,
        };
        assert_eq!(store.lock_path(), PathBuf::from("data/discovered.lock"));
        assert_eq!(
            store.progress_path(),
            PathBuf::from("data/discovered.progress.json")
        );
    }
}
