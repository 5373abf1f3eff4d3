use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub temp_dir: Option<String>,
    pub download_dir: Option<String>,
    pub metrics_port: Option<u16>,

    // Feature configs
    pub object_store: Option<ObjectStoreConfig>,
    pub workers: Option<WorkersConfig>,
    pub restore: Option<RestoreConfig>,
    pub upload_gc: Option<UploadGcConfig>,
    pub libraries: Vec<LibrarySeedConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub multipart_part_size_mb: Option<usize>,
    pub transfer_throughput_gbps: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WorkersConfig {
    pub archive_concurrency: Option<usize>,
    pub download_concurrency: Option<usize>,
    pub restore_concurrency: Option<usize>,
    pub library_concurrency: Option<usize>,
    pub progress_step_percent: Option<i32>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RestoreConfig {
    pub retention_days: Option<i32>,
    /// "bulk", "standard" or "expedited"
    pub tier: Option<String>,
    pub poll_interval_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct UploadGcConfig {
    pub retention_days: Option<u64>,
    pub interval_hours: Option<u64>,
}

/// A library to create at startup when none with the same name exists.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LibrarySeedConfig {
    pub name: String,
    pub path: String,
    pub category: String,
    pub storage_class: String,
    pub bucket: String,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
