//! Packing items into tar archives and unpacking downloaded ones.

use super::fs_utils::{archive_root, is_excluded_season};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, HeaderMode};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Nothing to archive at {0:?}")]
    MissingSource(PathBuf),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to walk {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write the tar archive of the item at `item_path` into `dest`.
///
/// Entry names start with the archived directory's own name. For TV items
/// (`is_tv`) a metadata item packs its show directory, and season folders are
/// left out at any depth since each season is archived as its own item.
pub fn pack_item(item_path: &str, is_tv: bool, dest: &Path) -> Result<(), ArchiveError> {
    let root = archive_root(item_path, is_tv);
    let root_name = root
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| ArchiveError::MissingSource(root.clone()))?;
    let root_metadata = std::fs::symlink_metadata(&root)
        .map_err(|_| ArchiveError::MissingSource(root.clone()))?;

    let out = File::create(dest).map_err(io_error(dest))?;
    let mut builder = Builder::new(BufWriter::new(out));
    builder.mode(HeaderMode::Complete);
    builder.follow_symlinks(false);

    if !root_metadata.is_dir() {
        builder
            .append_path_with_name(&root, &root_name)
            .map_err(io_error(&root))?;
    } else {
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !(is_tv && is_excluded_season(entry)));

        for entry in walker {
            let entry = entry.map_err(|source| ArchiveError::Walk {
                path: root.clone(),
                source,
            })?;
            let relative = entry.path().strip_prefix(&root).unwrap_or(Path::new(""));
            let name = root_name.join(relative);

            if entry.file_type().is_dir() {
                builder
                    .append_dir(&name, entry.path())
                    .map_err(io_error(entry.path()))?;
            } else {
                builder
                    .append_path_with_name(entry.path(), &name)
                    .map_err(io_error(entry.path()))?;
            }
        }
    }

    let mut writer = builder.into_inner().map_err(io_error(dest))?;
    writer.flush().map_err(io_error(dest))?;
    debug!("Packed {:?} into {:?}", root, dest);
    Ok(())
}

/// Extract `tar_path` into `into_dir`, then delete the archive whatever the
/// outcome.
pub fn unpack_archive(tar_path: &Path, into_dir: &Path) -> Result<(), ArchiveError> {
    let result = (|| {
        std::fs::create_dir_all(into_dir).map_err(io_error(into_dir))?;
        let file = File::open(tar_path).map_err(io_error(tar_path))?;
        Archive::new(BufReader::new(file))
            .unpack(into_dir)
            .map_err(io_error(tar_path))
    })();

    match std::fs::remove_file(tar_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete archive {:?}: {}", tar_path, e),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn entry_names(tar_path: &Path) -> Vec<String> {
        let mut archive = Archive::new(File::open(tar_path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_pack_single_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("song.flac");
        fs::write(&file, b"audio").unwrap();
        let tar_path = dir.path().join("out.tar");

        pack_item(file.to_str().unwrap(), false, &tar_path).unwrap();
        assert_eq!(entry_names(&tar_path), vec!["song.flac"]);
    }

    #[test]
    fn test_missing_source_is_reported() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        let err = pack_item(missing.to_str().unwrap(), false, &dir.path().join("o.tar"))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::MissingSource(_)));
    }

    #[test]
    fn test_metadata_leaf_outside_tv_packs_only_itself() {
        let dir = TempDir::new().unwrap();
        let movies = dir.path().join("movies");
        fs::create_dir_all(movies.join("metadata")).unwrap();
        fs::create_dir_all(movies.join("Other Movie")).unwrap();
        fs::write(movies.join("metadata/info.nfo"), b"nfo").unwrap();
        fs::write(movies.join("Other Movie/big.mkv"), b"frames").unwrap();
        let tar_path = dir.path().join("out.tar");

        pack_item(movies.join("metadata").to_str().unwrap(), false, &tar_path).unwrap();
        let names = entry_names(&tar_path);
        assert!(names.iter().all(|name| name.starts_with("metadata")));
        assert!(names.iter().any(|name| name == "metadata/info.nfo"));
    }

    #[test]
    fn test_tv_metadata_packs_show_without_seasons() {
        let dir = TempDir::new().unwrap();
        let show = dir.path().join("Show");
        fs::create_dir_all(show.join("Season 1")).unwrap();
        fs::write(show.join("poster.jpg"), b"jpg").unwrap();
        fs::write(show.join("Season 1/e01.mkv"), b"frames").unwrap();
        let tar_path = dir.path().join("out.tar");

        pack_item(show.join("metadata").to_str().unwrap(), true, &tar_path).unwrap();
        let names = entry_names(&tar_path);
        assert!(names.iter().any(|name| name == "Show/poster.jpg"));
        assert!(!names.iter().any(|name| name.contains("Season 1")));
    }

    #[test]
    fn test_unpack_deletes_archive_even_on_error() {
        let dir = TempDir::new().unwrap();
        let tar_path = dir.path().join("broken.tar");
        fs::write(&tar_path, b"definitely not a tar archive, just some bytes").unwrap();

        let result = unpack_archive(&tar_path, &dir.path().join("out"));
        assert!(result.is_err());
        assert!(!tar_path.exists());
    }
}
