use crate::job_queue::JobQueue;
use crate::media_store::{LibraryStore, MediaStore};
use crate::object_store::ObjectStore;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
///
/// Contains references to shared resources and a cancellation token
/// for graceful shutdown handling.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    pub media_store: Arc<dyn MediaStore>,

    pub library_store: Arc<dyn LibraryStore>,

    pub job_queue: Arc<dyn JobQueue>,

    pub object_store: Arc<dyn ObjectStore>,

    /// Runtime the async object store calls are driven on.
    runtime: Handle,
}

impl JobContext {
    /// Create a new job context. Must be called from within a tokio runtime.
    pub fn new(
        cancellation_token: CancellationToken,
        media_store: Arc<dyn MediaStore>,
        library_store: Arc<dyn LibraryStore>,
        job_queue: Arc<dyn JobQueue>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            cancellation_token,
            media_store,
            library_store,
            job_queue,
            object_store,
            runtime: Handle::current(),
        }
    }

    /// Same context, different cancellation token.
    pub fn with_cancellation_token(&self, cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            ..self.clone()
        }
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Run an async call to completion from the blocking job thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
