//! Bounded worker pool draining one queue.

use super::models::{QueueName, QueuePayload};
use super::store::JobQueue;
use crate::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for in-flight handlers before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Consumer of one queue's messages.
///
/// Handlers own their error handling: anything that goes wrong is logged and
/// rolled back inside `handle`, the processor only sees completion.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, payload: QueuePayload);
}

/// Claims messages from a queue and runs them on a handler with at most
/// `concurrency` in flight.
pub struct QueueProcessor {
    queue_name: QueueName,
    job_queue: Arc<dyn JobQueue>,
    handler: Arc<dyn QueueHandler>,
    concurrency: usize,
    poll_interval: Duration,
}

impl QueueProcessor {
    pub fn new(
        queue_name: QueueName,
        job_queue: Arc<dyn JobQueue>,
        handler: Arc<dyn QueueHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue_name,
            job_queue,
            handler,
            concurrency: concurrency.max(1),
            poll_interval,
        }
    }

    /// Main processing loop - call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Queue processor for {} starting (concurrency={}, poll_interval={:?})",
            self.queue_name, self.concurrency, self.poll_interval
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let notify = self.job_queue.notifier(self.queue_name);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(result) = in_flight.try_join_next() {
                if let Err(e) = result {
                    error!("{} handler task failed: {}", self.queue_name, e);
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            match self.job_queue.claim_next(self.queue_name) {
                Ok(Some(message)) => {
                    debug!("Claimed {} message {}", self.queue_name, message.id);
                    let job_queue = Arc::clone(&self.job_queue);
                    let handler = Arc::clone(&self.handler);
                    let queue_name = self.queue_name;
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let started = Instant::now();
                        match message.decode_payload() {
                            Ok(payload) => handler.handle(payload).await,
                            Err(e) => warn!("Dropping {} message {}: {}", queue_name, message.id, e),
                        }
                        metrics::record_queue_message(queue_name.as_str(), started.elapsed());
                        if let Err(e) = job_queue.complete(message.id) {
                            error!(
                                "Failed to complete {} message {}: {}",
                                queue_name, message.id, e
                            );
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = notify.notified() => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to claim from {}: {}", self.queue_name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(
                "Queue processor for {} waiting for {} in-flight jobs",
                self.queue_name,
                in_flight.len()
            );
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while in_flight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    "Abandoning {} in-flight {} jobs at shutdown",
                    in_flight.len(),
                    self.queue_name
                );
                in_flight.abort_all();
            }
        }

        info!("Queue processor for {} stopped", self.queue_name);
    }
}
