//! Specific background job implementations.

pub mod restore_poller;
pub mod upload_gc;

pub use restore_poller::RestorePollerJob;
pub use upload_gc::UploadGcJob;
