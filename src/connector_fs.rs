use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

use crate::config::FilesystemConnectorConfig;
use crate::connector::{Capabilities, Page, SourceConnector};
use crate::models::DocumentDescriptor;

/// Filesystem connector: enumerates files under a root directory.
///
/// Files are yielded in lexicographic path order, which makes the last
/// yielded relative path a valid resume cursor: a resumed run re-walks the
/// tree and skips everything at or before the cursor. Listing is cheap
/// relative to hashing, so re-walking keeps the cursor fully opaque to the
/// rest of the pipeline.
pub struct FilesystemConnector {
    name: String,
    config: FilesystemConnectorConfig,
}

impl FilesystemConnector {
    pub fn new(name: String, config: FilesystemConnectorConfig) -> Self {
        Self { name, config }
    }

    /// All matching relative paths under the root, sorted.
    fn matching_paths(&self) -> Result<Vec<String>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!(
                "Filesystem connector root does not exist: {}",
                root.display()
            );
        }

        let include_set = build_globset(&self.config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(self.config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        let mut paths = Vec::new();
        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) {
                continue;
            }
            if !include_set.is_match(&rel_str) {
                continue;
            }

            paths.push(rel_str);
        }

        paths.sort();
        Ok(paths)
    }

    fn describe(&self, rel_path: &str) -> Result<DocumentDescriptor> {
        let abs = self.config.root.join(rel_path);
        let metadata = std::fs::metadata(&abs)?;
        let modified_at: DateTime<Utc> = metadata.modified()?.into();

        let content = std::fs::read(&abs)?;
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let content_hash = format!("{:x}", hasher.finalize());

        let folder = Path::new(rel_path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty());

        Ok(DocumentDescriptor {
            path: rel_path.to_string(),
            size: metadata.len(),
            modified_at,
            content_hash,
            source_url: Some(format!("file://{}", abs.display())),
            business: json!({ "folder": folder }),
        })
    }
}

#[async_trait]
impl SourceConnector for FilesystemConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Enumerate files under a local directory"
    }

    fn connector_type(&self) -> &str {
        "filesystem"
    }

    fn source_path(&self) -> String {
        self.config.root.display().to_string()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            cursor_resume: true,
            deal_filtering: false,
            total_estimate: true,
        }
    }

    async fn next_page(&self, cursor: Option<&str>, page_size: usize) -> Result<Page> {
        let paths = self.matching_paths()?;

        let start = match cursor {
            // Resume strictly after the cursor path.
            Some(c) => paths.partition_point(|p| p.as_str() <= c),
            None => 0,
        };

        let window: Vec<&String> = paths.iter().skip(start).take(page_size).collect();

        let mut items = Vec::new();
        for rel in &window {
            match self.describe(rel) {
                Ok(desc) => items.push(desc),
                Err(e) => {
                    // File vanished between listing and stat; skip it.
                    tracing::warn!(path = %rel, error = %e, "skipping unreadable file");
                }
            }
        }

        // The cursor advances past the whole window even when some files in
        // it were unreadable, otherwise resumption would loop on them.
        let next_cursor = if start + window.len() < paths.len() {
            window.last().map(|p| (*p).clone())
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    async fn estimate_total(&self) -> Result<Option<u64>> {
        Ok(Some(self.matching_paths()?.len() as u64))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
