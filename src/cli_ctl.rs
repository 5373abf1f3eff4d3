use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli_style;

use cli_style::{get_styles, TableBuilder};
use media_archiver::config::FileConfig;
use media_archiver::job_queue::{JobQueue, QueueName, SqliteJobQueue};
use media_archiver::media_store::{
    Library, LibraryStore, MediaCategory, MediaItem, MediaStore, SqliteMediaStore, StorageClass,
};
use media_archiver::JobControl;

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_category(s: &str) -> Result<MediaCategory> {
    MediaCategory::from_db_str(s).ok_or_else(|| anyhow!("Unknown category: {}", s))
}

fn parse_storage_class(s: &str) -> Result<StorageClass> {
    StorageClass::from_db_str(s).ok_or_else(|| anyhow!("Unknown storage class: {}", s))
}

#[derive(Parser, Debug)]
#[command(styles = get_styles(), about = "Operator commands for the media archiver")]
struct CliArgs {
    /// Directory containing archive.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Read db_dir from the server's TOML configuration file instead.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists every library.
    Libraries,

    /// Creates a library over a path template such as /media/tv/${show}.
    AddLibrary {
        name: String,
        path: String,
        bucket: String,
        #[clap(long, value_parser = parse_category, default_value = "OTHER")]
        category: MediaCategory,
        #[clap(long, value_parser = parse_storage_class, default_value = "STANDARD")]
        storage_class: StorageClass,
    },

    /// Lists the items of a library with their job state.
    Items { library_id: i64 },

    /// Shows how many messages wait in each queue.
    Queues,

    /// Archives one item.
    Archive { item_id: i64 },

    /// Archives every not archived or out of date item of a library.
    ArchiveLibrary { library_id: i64 },

    /// Recovers an item, thawing it first when its storage class requires it.
    Download { item_id: i64 },

    /// Cancels the running job of an item.
    Cancel { item_id: i64 },

    /// Cancels every running archive job.
    CancelAllArchives,

    /// Cancels every running download or restore job.
    CancelAllDownloads,

    /// Acknowledges finished downloads of the given items.
    Clear {
        #[clap(required = true)]
        item_ids: Vec<i64>,
    },

    /// Acknowledges every finished download.
    ClearAll,

    /// Rescans a library's directory tree.
    Scan { library_id: i64 },

    /// Refreshes archived status from a library's bucket.
    Sync { library_id: i64 },
}

fn resolve_db_path(args: &CliArgs) -> Result<PathBuf> {
    let db_dir = match (&args.db_dir, &args.config) {
        (Some(dir), _) => dir.clone(),
        (None, Some(config)) => FileConfig::load(config)?
            .db_dir
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("db_dir is not set in {:?}", config))?,
        (None, None) => return Err(anyhow!("Either --db-dir or --config must be given")),
    };
    if !db_dir.is_dir() {
        return Err(anyhow!("Database directory does not exist: {:?}", db_dir));
    }
    Ok(db_dir.join("archive.db"))
}

fn job_state(item: &MediaItem) -> String {
    if item.is_archiving {
        if item.is_job_cancelled {
            "archive cancelling".to_string()
        } else if item.is_tarring {
            "packing".to_string()
        } else if item.upload_progress >= 0 {
            format!("uploading {}%", item.upload_progress)
        } else {
            "archive queued".to_string()
        }
    } else if item.is_recovering {
        if item.download_outcome.is_finished() {
            format!("download {:?}", item.download_outcome).to_lowercase()
        } else if item.is_job_cancelled {
            "download cancelling".to_string()
        } else if item.is_restoring {
            "thawing".to_string()
        } else if item.download_progress >= 0 {
            format!("downloading {}%", item.download_progress)
        } else {
            "download queued".to_string()
        }
    } else {
        "-".to_string()
    }
}

fn print_libraries(libraries: &[Library]) {
    let mut table = TableBuilder::new(vec![
        "ID", "NAME", "CATEGORY", "CLASS", "BUCKET", "PATH", "UPDATING",
    ]);
    for library in libraries {
        table.add_row(vec![
            library.id.to_string(),
            library.name.clone(),
            library.category.as_db_str().to_string(),
            library.storage_class.as_db_str().to_string(),
            library.bucket_name.clone(),
            library.path.clone(),
            library.is_updating.to_string(),
        ]);
    }
    table.print();
}

fn print_items(items: &[MediaItem]) {
    let mut table = TableBuilder::new(vec!["ID", "PATH", "SIZE", "STATUS", "ARCHIVED", "JOB"]);
    for item in items {
        table.add_row(vec![
            item.id.to_string(),
            item.path.clone(),
            format!("{:#}", byte_unit::Byte::from(item.size)),
            item.archived_status.as_db_str().to_string(),
            item.date_archived
                .map(|date| date.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
            job_state(item),
        ]);
    }
    table.print();
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let store = Arc::new(SqliteMediaStore::new(resolve_db_path(&args)?)?);
    let job_queue = Arc::new(SqliteJobQueue::new(store.connection()));
    let control = JobControl::new(store.clone(), store.clone(), job_queue.clone());

    match args.command {
        Command::Libraries => print_libraries(&LibraryStore::find_all(store.as_ref())?),
        Command::AddLibrary {
            name,
            path,
            bucket,
            category,
            storage_class,
        } => {
            let library = Library::new(name, path, category, storage_class, bucket);
            let id = LibraryStore::insert(store.as_ref(), &library)?;
            println!("Created library {} with id {}", library.name, id);
        }
        Command::Items { library_id } => {
            print_items(&store.find_by_library_id(library_id)?);
        }
        Command::Queues => {
            let mut table = TableBuilder::new(vec!["QUEUE", "PENDING"]);
            for queue in QueueName::ALL {
                table.add_row(vec![
                    queue.to_string(),
                    job_queue.pending_count(queue)?.to_string(),
                ]);
            }
            table.print();
        }
        Command::Archive { item_id } => {
            control.request_archive(item_id)?;
            println!("Archive of item {} enqueued", item_id);
        }
        Command::ArchiveLibrary { library_id } => {
            let count = control.archive_library(library_id)?;
            println!("{} items enqueued for archiving", count);
        }
        Command::Download { item_id } => {
            let queue = control.prepare_download(item_id)?;
            println!("Recovery of item {} enqueued on the {} queue", item_id, queue);
        }
        Command::Cancel { item_id } => {
            control.cancel_job(item_id)?;
            println!("Cancellation of item {} requested", item_id);
        }
        Command::CancelAllArchives => {
            println!("{} archive jobs cancelled", control.cancel_all_archive_jobs()?);
        }
        Command::CancelAllDownloads => {
            println!("{} download jobs cancelled", control.cancel_all_download_jobs()?);
        }
        Command::Clear { item_ids } => {
            println!("{} items cleared", control.clear_finished(&item_ids)?);
        }
        Command::ClearAll => {
            println!("{} items cleared", control.clear_all_finished()?);
        }
        Command::Scan { library_id } => {
            control.request_scan(library_id)?;
            println!("Scan of library {} enqueued", library_id);
        }
        Command::Sync { library_id } => {
            control.request_sync(library_id)?;
            println!("Sync of library {} enqueued", library_id);
        }
    }

    Ok(())
}
