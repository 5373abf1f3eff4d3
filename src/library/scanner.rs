//! Discovers media items by walking a library's path template.

use crate::archive::{directory_size, is_season_name, modified_time, METADATA_SUFFIX};
use crate::media_store::{ArchivedStatus, Library, MediaItem, MediaStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A `${name}` segment fans out over every subdirectory at that level.
fn is_variable_segment(segment: &str) -> bool {
    segment.starts_with("${") && segment.ends_with('}')
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let read_from = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    let mut entries = std::fs::read_dir(read_from)
        .with_context(|| format!("Failed to list {:?}", read_from))?
        .map(|entry| entry.map(|e| dir.join(e.file_name())))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("Failed to list {:?}", read_from))?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct DirectoryScanner {
    media_store: Arc<dyn MediaStore>,
}

impl DirectoryScanner {
    pub fn new(media_store: Arc<dyn MediaStore>) -> Self {
        Self { media_store }
    }

    /// Walk `library.path` and upsert an item for every leaf. Returns the
    /// number of items created or refreshed.
    pub fn scan(&self, library: &Library) -> Result<usize> {
        let segments: Vec<&str> = library
            .path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let start = if library.path.starts_with('/') {
            PathBuf::from("/")
        } else {
            PathBuf::new()
        };

        let mut upserted = 0;
        self.walk(library, &start, &segments, &mut upserted)?;
        info!(
            "Scanned library {} ({}): {} items",
            library.name, library.path, upserted
        );
        Ok(upserted)
    }

    fn walk(
        &self,
        library: &Library,
        dir: &Path,
        segments: &[&str],
        upserted: &mut usize,
    ) -> Result<()> {
        if !dir.as_os_str().is_empty() && !dir.is_dir() {
            debug!("Skipping missing directory {:?}", dir);
            return Ok(());
        }

        match segments.split_first() {
            None => {
                for entry in sorted_entries(dir)? {
                    *upserted += self.upsert_entry(library, &entry)?;
                }
            }
            Some((segment, rest)) if is_variable_segment(segment) => {
                for entry in sorted_entries(dir)? {
                    if entry.is_dir() {
                        self.walk(library, &entry, rest, upserted)?;
                    }
                }
            }
            Some((segment, rest)) => {
                self.walk(library, &dir.join(segment), rest, upserted)?;
            }
        }
        Ok(())
    }

    fn upsert_entry(&self, library: &Library, entry: &Path) -> Result<usize> {
        let modified = modified_time(entry)
            .with_context(|| format!("Failed to read modification time of {:?}", entry))?;

        if !library.is_tv() {
            self.upsert(library, file_name(entry), entry, modified, || {
                directory_size(entry, false)
            })?;
            return Ok(1);
        }

        let metadata_key = format!("{}{}", entry.to_string_lossy(), METADATA_SUFFIX);
        self.upsert(library, file_name(entry), Path::new(&metadata_key), modified, || {
            directory_size(entry, true)
        })?;
        let mut count = 1;

        if entry.is_dir() {
            for season in sorted_entries(entry)? {
                if season.is_dir() && is_season_name(&file_name(&season)) {
                    let season_modified = modified_time(&season).with_context(|| {
                        format!("Failed to read modification time of {:?}", season)
                    })?;
                    self.upsert(library, file_name(&season), &season, season_modified, || {
                        directory_size(&season, false)
                    })?;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn upsert(
        &self,
        library: &Library,
        name: String,
        key: &Path,
        modified: DateTime<Utc>,
        size: impl FnOnce() -> u64,
    ) -> Result<()> {
        let path = key.to_string_lossy().into_owned();
        match self.media_store.find_by_path(&path)? {
            Some(mut item) => {
                item.date_last_modified = modified;
                let changed_since_archive = item
                    .date_archived
                    .map(|archived| modified > archived)
                    .unwrap_or(false);
                if item.archived_status == ArchivedStatus::Archived && changed_since_archive {
                    info!("{} changed since it was archived, now out of date", path);
                    item.archived_status = ArchivedStatus::OutOfDate;
                    item.size = size();
                }
                self.media_store.save(&item)
            }
            None => {
                debug!("Discovered {}", path);
                let item = MediaItem::new(library.id, name, path, modified, size());
                self.media_store.insert(&item).map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_store::{LibraryStore, MediaCategory, SqliteMediaStore, StorageClass};
    use chrono::Duration;
    use std::fs;
    use tempfile::TempDir;

    fn setup(category: MediaCategory, template: &str) -> (Arc<SqliteMediaStore>, Library) {
        let store = Arc::new(SqliteMediaStore::in_memory().unwrap());
        let mut library = Library::new("lib", template, category, StorageClass::Standard, "bucket");
        library.id = LibraryStore::insert(store.as_ref(), &library).unwrap();
        (store, library)
    }

    #[test]
    fn test_variable_segment_detection() {
        assert!(is_variable_segment("${artist}"));
        assert!(!is_variable_segment("music"));
        assert!(!is_variable_segment("${broken"));
    }

    #[test]
    fn test_missing_literal_segment_ends_branch() {
        let dir = TempDir::new().unwrap();
        let template = format!("{}/nothing/here", dir.path().display());
        let (store, library) = setup(MediaCategory::Other, &template);
        let scanner = DirectoryScanner::new(store.clone());
        assert_eq!(scanner.scan(&library).unwrap(), 0);
    }

    #[test]
    fn test_files_are_leaves_too() {
        let dir = TempDir::new().unwrap();
        let movies = dir.path().join("movies");
        fs::create_dir_all(movies.join("A Movie")).unwrap();
        fs::write(movies.join("A Movie/movie.mkv"), vec![0u8; 42]).unwrap();
        fs::write(movies.join("loose.mkv"), vec![0u8; 7]).unwrap();
        let (store, library) = setup(MediaCategory::Other, movies.to_str().unwrap());

        let scanner = DirectoryScanner::new(store.clone());
        assert_eq!(scanner.scan(&library).unwrap(), 2);

        let dir_item = store
            .find_by_path(movies.join("A Movie").to_str().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(dir_item.size, 42);
        assert_eq!(dir_item.name, "A Movie");
        let file_item = store
            .find_by_path(movies.join("loose.mkv").to_str().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(file_item.size, 7);
    }

    #[test]
    fn test_archived_item_goes_out_of_date_when_modified() {
        let dir = TempDir::new().unwrap();
        let movies = dir.path().join("movies");
        fs::create_dir_all(movies.join("A")).unwrap();
        fs::write(movies.join("A/a.mkv"), vec![0u8; 10]).unwrap();
        let (store, library) = setup(MediaCategory::Other, movies.to_str().unwrap());
        let scanner = DirectoryScanner::new(store.clone());
        scanner.scan(&library).unwrap();

        let path = movies.join("A").to_string_lossy().into_owned();
        let mut item = store.find_by_path(&path).unwrap().unwrap();
        item.archived_status = ArchivedStatus::Archived;
        item.date_archived = Some(Utc::now() - Duration::days(1));
        item.size = 1;
        MediaStore::save(store.as_ref(), &item).unwrap();

        scanner.scan(&library).unwrap();
        let item = store.find_by_path(&path).unwrap().unwrap();
        assert_eq!(item.archived_status, ArchivedStatus::OutOfDate);
        assert_eq!(item.size, 10);
    }
}
