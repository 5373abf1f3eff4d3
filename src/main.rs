use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use media_archiver::background_jobs::jobs::{RestorePollerJob, UploadGcJob};
use media_archiver::background_jobs::{JobContext, JobScheduler};
use media_archiver::config;
use media_archiver::job_queue::{JobQueue, QueueHandler, QueueName, QueueProcessor, SqliteJobQueue};
use media_archiver::library::{ArchiveSetReconciler, DirectoryScanner};
use media_archiver::media_store::{Library, LibraryStore, MediaStore, SqliteMediaStore};
use media_archiver::metrics;
use media_archiver::object_store::{ObjectStore, S3ObjectStore};
use media_archiver::recovery::StartupReconciler;
use media_archiver::workers::{
    ArchiveWorker, DownloadWorker, LibraryScanWorker, LibrarySyncWorker, RestoreWorker,
};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing archive.db. Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// Scratch directory for archives being uploaded.
    #[clap(long, value_parser = parse_path)]
    pub temp_dir: Option<PathBuf>,

    /// Directory recovered items are downloaded and unpacked into.
    #[clap(long, value_parser = parse_path)]
    pub download_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Object store region.
    #[clap(long)]
    pub aws_region: Option<String>,

    /// Custom S3-compatible endpoint, e.g. a MinIO server.
    #[clap(long)]
    pub s3_endpoint: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            temp_dir: args.temp_dir.clone(),
            download_dir: args.download_dir.clone(),
            metrics_port: args.metrics_port,
            aws_region: args.aws_region.clone(),
            s3_endpoint: args.s3_endpoint.clone(),
        }
    }
}

fn seed_libraries(library_store: &dyn LibraryStore, seeds: &[Library]) -> Result<()> {
    for seed in seeds {
        if library_store.find_by_name(&seed.name)?.is_some() {
            continue;
        }
        let id = library_store.insert(seed)?;
        info!(
            "Created library {} (id {}) over {} into bucket {}",
            seed.name, id, seed.path, seed.bucket_name
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  temp_dir: {:?}", app_config.temp_dir);
    info!("  download_dir: {:?}", app_config.download_dir);
    info!(
        "  object store: region {}, endpoint {:?}, {} MB parts, target {} Gbps",
        app_config.object_store.region,
        app_config.object_store.endpoint,
        app_config.object_store.multipart_part_size_mb,
        app_config.object_store.transfer_throughput_gbps
    );

    for dir in [&app_config.temp_dir, &app_config.download_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    info!("Initializing metrics...");
    metrics::init_metrics();

    if !app_config.archive_db_path().exists() {
        info!(
            "Creating new archive database at {:?}",
            app_config.archive_db_path()
        );
    }
    let store = Arc::new(SqliteMediaStore::new(app_config.archive_db_path())?);
    let media_store: Arc<dyn MediaStore> = store.clone();
    let library_store: Arc<dyn LibraryStore> = store.clone();
    let job_queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(store.connection()));

    seed_libraries(library_store.as_ref(), &app_config.libraries)?;
    metrics::set_libraries_total(library_store.find_all()?.len());

    // Must finish before any queue is drained.
    StartupReconciler::new(media_store.clone(), library_store.clone(), job_queue.clone()).run()?;

    let object_store: Arc<dyn ObjectStore> =
        Arc::new(S3ObjectStore::new(&app_config.object_store.s3_settings()?));

    let shutdown_token = CancellationToken::new();
    let workers = &app_config.workers;
    let spawn_processor = |queue_name: QueueName, handler: Arc<dyn QueueHandler>, concurrency: usize| {
        let processor = QueueProcessor::new(
            queue_name,
            job_queue.clone(),
            handler,
            concurrency,
            workers.poll_interval(),
        );
        let token = shutdown_token.clone();
        tokio::spawn(async move { processor.run(token).await })
    };

    let processor_handles = vec![
        spawn_processor(
            QueueName::Archive,
            Arc::new(ArchiveWorker::new(
                media_store.clone(),
                library_store.clone(),
                object_store.clone(),
                app_config.temp_dir.clone(),
                workers.progress_step_percent,
            )),
            workers.archive_concurrency,
        ),
        spawn_processor(
            QueueName::Download,
            Arc::new(DownloadWorker::new(
                media_store.clone(),
                library_store.clone(),
                object_store.clone(),
                app_config.download_dir.clone(),
                workers.progress_step_percent,
            )),
            workers.download_concurrency,
        ),
        spawn_processor(
            QueueName::Restore,
            Arc::new(RestoreWorker::new(
                media_store.clone(),
                library_store.clone(),
                object_store.clone(),
                job_queue.clone(),
                app_config.restore.tier,
                app_config.restore.retention_days,
            )),
            workers.restore_concurrency,
        ),
        spawn_processor(
            QueueName::LibraryScan,
            Arc::new(LibraryScanWorker::new(
                library_store.clone(),
                DirectoryScanner::new(media_store.clone()),
            )),
            workers.library_concurrency,
        ),
        spawn_processor(
            QueueName::LibrarySync,
            Arc::new(LibrarySyncWorker::new(
                library_store.clone(),
                ArchiveSetReconciler::new(media_store.clone(), object_store.clone()),
            )),
            workers.library_concurrency,
        ),
    ];

    // Set up background job scheduler
    let job_context = JobContext::new(
        shutdown_token.child_token(),
        media_store,
        library_store,
        job_queue,
        object_store,
    );
    let mut scheduler = JobScheduler::new(shutdown_token.clone(), job_context);
    scheduler.register_job(Arc::new(RestorePollerJob::new(Duration::from_secs(
        app_config.restore.poll_interval_hours * 60 * 60,
    ))));
    scheduler.register_job(Arc::new(UploadGcJob::new(
        app_config.upload_gc.retention_days,
        Duration::from_secs(app_config.upload_gc.interval_hours * 60 * 60),
    )));
    info!(
        "Job scheduler initialized with {} job(s)",
        scheduler.job_count()
    );
    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    let mut metrics_handle = tokio::spawn(metrics::run_metrics_server(
        app_config.metrics_port,
        shutdown_token.clone(),
    ));
    info!("Metrics available at port {}!", app_config.metrics_port);

    tokio::select! {
        result = &mut metrics_handle => {
            match result {
                Ok(Ok(())) => info!("Metrics server stopped"),
                Ok(Err(e)) => error!("Metrics server failed: {:#}", e),
                Err(e) => error!("Metrics server task failed: {}", e),
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
    }

    shutdown_token.cancel();
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task failed: {}", e);
    }
    for handle in processor_handles {
        if let Err(e) = handle.await {
            error!("Queue processor task failed: {}", e);
        }
    }
    info!("Shutdown complete");
    Ok(())
}
