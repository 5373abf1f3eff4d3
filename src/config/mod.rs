mod file_config;

pub use file_config::{
    FileConfig, LibrarySeedConfig, ObjectStoreConfig, RestoreConfig, UploadGcConfig, WorkersConfig,
};

use crate::media_store::{Library, MediaCategory, StorageClass};
use crate::object_store::{RestoreTier, S3Settings};
use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TEMP_DIR: &str = "/temporaryDirectory";
pub const DEFAULT_DOWNLOAD_DIR: &str = "/downloadDirectory";
pub const DEFAULT_METRICS_PORT: u16 = 9091;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub aws_region: Option<String>,
    pub s3_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub download_dir: PathBuf,
    pub metrics_port: u16,

    // Feature configs (with defaults)
    pub object_store: ObjectStoreSettings,
    pub workers: WorkerSettings,
    pub restore: RestoreSettings,
    pub upload_gc: UploadGcSettings,

    /// Libraries to create at startup, not yet persisted.
    pub libraries: Vec<Library>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| anyhow!("db_dir must be specified via --db-dir or in config file"))?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let temp_dir = file
            .temp_dir
            .map(PathBuf::from)
            .or_else(|| cli.temp_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR));
        let download_dir = file
            .download_dir
            .map(PathBuf::from)
            .or_else(|| cli.download_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let os_file = file.object_store.unwrap_or_default();
        let object_store = ObjectStoreSettings {
            region: os_file
                .region
                .or_else(|| cli.aws_region.clone())
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint: os_file.endpoint.or_else(|| cli.s3_endpoint.clone()),
            access_key_id: os_file
                .access_key_id
                .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok()),
            secret_access_key: os_file
                .secret_access_key
                .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok()),
            multipart_part_size_mb: os_file.multipart_part_size_mb.unwrap_or(8),
            transfer_throughput_gbps: os_file.transfer_throughput_gbps.unwrap_or(0.5),
        };

        let defaults = WorkerSettings::default();
        let w_file = file.workers.unwrap_or_default();
        let workers = WorkerSettings {
            archive_concurrency: w_file
                .archive_concurrency
                .unwrap_or(defaults.archive_concurrency),
            download_concurrency: w_file
                .download_concurrency
                .unwrap_or(defaults.download_concurrency),
            restore_concurrency: w_file
                .restore_concurrency
                .unwrap_or(defaults.restore_concurrency),
            library_concurrency: w_file
                .library_concurrency
                .unwrap_or(defaults.library_concurrency),
            progress_step_percent: w_file
                .progress_step_percent
                .unwrap_or(defaults.progress_step_percent),
            poll_interval_ms: w_file.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
        };
        if !(1..=100).contains(&workers.progress_step_percent) {
            bail!(
                "progress_step_percent must be between 1 and 100, got {}",
                workers.progress_step_percent
            );
        }

        let r_file = file.restore.unwrap_or_default();
        let tier = match r_file.tier {
            Some(tier) => RestoreTier::from_str(&tier)
                .ok_or_else(|| anyhow!("Unknown restore tier: {}", tier))?,
            None => RestoreTier::default(),
        };
        let restore = RestoreSettings {
            retention_days: r_file.retention_days.unwrap_or(3),
            tier,
            poll_interval_hours: r_file.poll_interval_hours.unwrap_or(1),
        };

        let gc_file = file.upload_gc.unwrap_or_default();
        let upload_gc = UploadGcSettings {
            retention_days: gc_file.retention_days.unwrap_or(2),
            interval_hours: gc_file.interval_hours.unwrap_or(24),
        };

        let libraries = file
            .libraries
            .iter()
            .map(parse_library_seed)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            db_dir,
            temp_dir,
            download_dir,
            metrics_port,
            object_store,
            workers,
            restore,
            upload_gc,
            libraries,
        })
    }

    pub fn archive_db_path(&self) -> PathBuf {
        self.db_dir.join("archive.db")
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub multipart_part_size_mb: usize,
    pub transfer_throughput_gbps: f64,
}

impl ObjectStoreSettings {
    pub fn s3_settings(&self) -> Result<S3Settings> {
        let (Some(access_key_id), Some(secret_access_key)) =
            (&self.access_key_id, &self.secret_access_key)
        else {
            bail!(
                "Object store credentials missing: set [object_store] keys or AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY"
            );
        };
        Ok(S3Settings {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            access_key_id: access_key_id.clone(),
            secret_access_key: secret_access_key.clone(),
            part_size_bytes: self.multipart_part_size_mb * 1024 * 1024,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub archive_concurrency: usize,
    pub download_concurrency: usize,
    pub restore_concurrency: usize,
    pub library_concurrency: usize,
    pub progress_step_percent: i32,
    pub poll_interval_ms: u64,
}

impl WorkerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            archive_concurrency: 5,
            download_concurrency: 5,
            restore_concurrency: 5,
            library_concurrency: 1,
            progress_step_percent: 5,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreSettings {
    pub retention_days: i32,
    pub tier: RestoreTier,
    pub poll_interval_hours: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadGcSettings {
    pub retention_days: u64,
    pub interval_hours: u64,
}

fn parse_library_seed(seed: &LibrarySeedConfig) -> Result<Library> {
    let category = MediaCategory::from_db_str(&seed.category)
        .ok_or_else(|| anyhow!("Library {}: unknown category {}", seed.name, seed.category))?;
    let storage_class = StorageClass::from_db_str(&seed.storage_class).ok_or_else(|| {
        anyhow!(
            "Library {}: unknown storage class {}",
            seed.name,
            seed.storage_class
        )
    })?;
    Ok(Library::new(
        seed.name.clone(),
        seed.path.clone(),
        category,
        storage_class,
        seed.bucket.clone(),
    ))
}
