//! Filesystem helpers shared by the scanner, the packer and the workers.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Suffix of the item holding a TV show's files outside its season folders.
pub const METADATA_SUFFIX: &str = "/metadata";

/// Directories whose lowercased name contains "season" are season folders.
pub fn is_season_name(name: &str) -> bool {
    name.to_lowercase().contains("season")
}

/// Directory or file an item archives. A TV metadata item archives its show
/// directory; every other item archives its own path.
pub fn archive_root(item_path: &str, is_tv: bool) -> PathBuf {
    if !is_tv {
        return PathBuf::from(item_path);
    }
    PathBuf::from(item_path.strip_suffix(METADATA_SUFFIX).unwrap_or(item_path))
}

/// Total size in bytes of the regular files under `path`. With
/// `exclude_seasons`, season folders below `path` are skipped at any depth.
pub fn directory_size(path: &Path, exclude_seasons: bool) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_entry(|entry| !(exclude_seasons && is_excluded_season(entry)))
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

pub(crate) fn is_excluded_season(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && is_season_name(&entry.file_name().to_string_lossy())
}

pub fn modified_time(path: &Path) -> io::Result<DateTime<Utc>> {
    Ok(DateTime::<Utc>::from(std::fs::metadata(path)?.modified()?))
}

fn relative(item_path: &str) -> &str {
    item_path.trim_start_matches('/')
}

/// Where the archive of `item_path` is downloaded: `<download_dir>/<path>.tar`.
pub fn download_target(download_dir: &Path, item_path: &str) -> PathBuf {
    download_dir.join(format!("{}.tar", relative(item_path)))
}

/// Directory a downloaded archive is unpacked into: the parent of its
/// download target.
pub fn unpack_dir(download_dir: &Path, item_path: &str) -> PathBuf {
    let target = download_target(download_dir, item_path);
    target
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| download_dir.to_path_buf())
}
