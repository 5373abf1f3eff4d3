//! Library level operations: discovering items on disk and reconciling them
//! with the bucket contents.

mod scanner;
mod sync;

pub use scanner::DirectoryScanner;
pub use sync::ArchiveSetReconciler;
