//! Durable named queues and the worker pools that drain them.
//!
//! Messages live in `archive.db` so the operator CLI can enqueue work for a
//! running server. Each queue has its own [`QueueProcessor`] with a bounded
//! number of in-flight handlers.

mod models;
mod processor;
mod store;

pub use models::{QueueMessage, QueueName, QueuePayload};
pub use processor::{QueueHandler, QueueProcessor};
pub use store::{JobQueue, SqliteJobQueue};
