//! Installer configuration.
//!
//! Every field has a default so a partial JSON file (or none at all) yields a
//! usable configuration.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Limits and policies applied to every install run.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallConfig {
    /// Largest single archive entry accepted, in MiB (default 100)
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size_mb: u64,

    /// Largest archive accepted by the HTTP layer, in MiB (default 100)
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size_mb: u64,

    /// Number of user-data records sent per bulk call (default 1000)
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Emit a progress line every N links (default 100)
    #[serde(default = "default_links_output")]
    pub links_output_stream_size: usize,

    /// Child resources a WebDAV collection may hold (default 1000)
    #[serde(default = "default_max_children")]
    pub max_child_resource_count: usize,

    /// Persist the progress record on every non-error report (default true)
    #[serde(default = "default_true")]
    pub publish_progress: bool,

    /// Absolute base URL used when rewriting ACL role references
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Lifetime of a cached progress record in seconds (default 86400)
    #[serde(default = "default_progress_ttl")]
    pub progress_ttl_secs: u64,

    /// Directory where uploaded archives are spooled before installation
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

fn default_max_entry_size() -> u64 { 100 }
fn default_max_archive_size() -> u64 { 100 }
fn default_bulk_size() -> usize { 1000 }
fn default_links_output() -> usize { 100 }
fn default_max_children() -> usize { 1000 }
fn default_true() -> bool { true }
fn default_base_url() -> String { "http://localhost:3000".to_string() }
fn default_progress_ttl() -> u64 { 86400 }
fn default_temp_dir() -> PathBuf { std::env::temp_dir() }

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            max_entry_size_mb: default_max_entry_size(),
            max_archive_size_mb: default_max_archive_size(),
            bulk_size: default_bulk_size(),
            links_output_stream_size: default_links_output(),
            max_child_resource_count: default_max_children(),
            publish_progress: true,
            base_url: default_base_url(),
            progress_ttl_secs: default_progress_ttl(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl InstallConfig {
    /// Load a configuration file, falling back to defaults for missing keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
        let config: InstallConfig = serde_json::from_str(&raw)?;
        if config.bulk_size == 0 {
            return Err(anyhow!("bulk_size must be greater than zero"));
        }
        Ok(config)
    }

    pub fn with_bulk_size(mut self, bulk_size: usize) -> Self {
        self.bulk_size = bulk_size.max(1);
        self
    }

    pub fn with_max_child_resource_count(mut self, count: usize) -> Self {
        self.max_child_resource_count = count;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.temp_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn max_entry_size_bytes(&self) -> u64 {
        self.max_entry_size_mb * 1024 * 1024
    }

    pub fn max_archive_size_bytes(&self) -> u64 {
        self.max_archive_size_mb * 1024 * 1024
    }
}
