//! Source connector interface.
//!
//! A connector enumerates one collection of documents page by page, handing
//! back an opaque cursor after each page so a crashed run can resume where
//! it stopped. Cloud-storage and CRM connectors implement this trait out of
//! tree; the built-in [`FilesystemConnector`](crate::connector_fs) is the
//! reference implementation and what the integration tests drive.
//!
//! Connector variants differ in what they can do (cursor resume, deal-level
//! filtering, total estimation). Those differences are declared once at
//! construction through [`Capabilities`] — callers branch on the struct, not
//! on probing the connector per call.

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Config;
use crate::models::DocumentDescriptor;

/// What a connector instance can do, resolved at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The connector accepts a previously returned cursor and resumes
    /// enumeration after it.
    pub cursor_resume: bool,
    /// The connector can restrict enumeration to a business deal/folder.
    pub deal_filtering: bool,
    /// `estimate_total` returns a usable order-of-magnitude count.
    pub total_estimate: bool,
}

/// One page of enumeration results.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<DocumentDescriptor>,
    /// Cursor to pass to the next `next_page` call. `None` means the source
    /// is exhausted.
    pub next_cursor: Option<String>,
}

/// A data source that produces document descriptors for discovery.
///
/// # Contract
///
/// - Descriptors are yielded in a stable source order; re-running an
///   uninterrupted enumeration yields the same sequence.
/// - `next_page(None, _)` starts from the beginning; `next_page(Some(c), _)`
///   resumes strictly after the position encoded by `c`.
/// - Enumeration is at-least-once under crashes: a consumer may see up to
///   one page of duplicates on resume and must be idempotent per path.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Collection name this connector instance serves (e.g. `"deals"`).
    fn name(&self) -> &str;

    /// One-line description for status output.
    fn description(&self) -> &str;

    /// Connector type identifier (e.g. `"filesystem"`).
    fn connector_type(&self) -> &str {
        "custom"
    }

    /// Human-readable source location recorded in progress snapshots.
    fn source_path(&self) -> String;

    /// Declared capabilities of this instance.
    fn capabilities(&self) -> Capabilities;

    /// Fetch the next page of descriptors.
    async fn next_page(&self, cursor: Option<&str>, page_size: usize) -> Result<Page>;

    /// Best-effort total count for percentage reporting. Connectors without
    /// the `total_estimate` capability return `Ok(None)`.
    async fn estimate_total(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Registry of connector instances resolved from the config file.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// Pre-load all filesystem connector instances from the config.
    pub fn from_config(config: &Config) -> Self {
        use crate::connector_fs::FilesystemConnector;

        let mut registry = Self::new();
        for (name, cfg) in &config.connectors.filesystem {
            registry.register(Box::new(FilesystemConnector::new(name.clone(), cfg.clone())));
        }
        registry
    }

    pub fn register(&mut self, connector: Box<dyn SourceConnector>) {
        self.connectors.push(connector);
    }

    pub fn connectors(&self) -> &[Box<dyn SourceConnector>] {
        &self.connectors
    }

    /// Find the connector serving a collection.
    pub fn find(&self, collection: &str) -> Option<&dyn SourceConnector> {
        self.connectors
            .iter()
            .find(|c| c.name() == collection)
            .map(|c| c.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
