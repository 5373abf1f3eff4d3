//! Tar packing of media items and the path conventions around it.

mod fs_utils;
mod packer;

pub use fs_utils::{
    archive_root, directory_size, download_target, is_season_name, modified_time, unpack_dir,
    METADATA_SUFFIX,
};
pub use packer::{pack_item, unpack_archive, ArchiveError};
