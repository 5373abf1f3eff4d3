//! Durable job queue stored next to the media items.

use super::models::*;
use crate::media_store::{from_millis, to_millis};
use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Queue operations used by operator actions, workers and processors.
pub trait JobQueue: Send + Sync {
    /// Append a message to `queue` and return its id.
    fn enqueue(&self, queue: QueueName, payload: &QueuePayload) -> Result<i64>;

    /// Atomically claim the oldest pending message of `queue` (PENDING -> IN_PROGRESS).
    fn claim_next(&self, queue: QueueName) -> Result<Option<QueueMessage>>;

    /// Remove a message once its handler has finished, whatever the outcome.
    fn complete(&self, id: i64) -> Result<()>;

    /// Drop every message. Returns the number removed.
    fn purge(&self) -> Result<usize>;

    fn pending_count(&self, queue: QueueName) -> Result<usize>;

    /// Signalled whenever this process enqueues onto `queue`.
    fn notifier(&self, queue: QueueName) -> Arc<Notify>;
}

pub struct SqliteJobQueue {
    conn: Arc<Mutex<Connection>>,
    notifiers: [Arc<Notify>; 5],
}

impl SqliteJobQueue {
    /// Build a queue over an already opened archive database connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            notifiers: std::array::from_fn(|_| Arc::new(Notify::new())),
        }
    }
}

impl JobQueue for SqliteJobQueue {
    fn enqueue(&self, queue: QueueName, payload: &QueuePayload) -> Result<i64> {
        let json = payload.to_json()?;
        let id = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO job_queue (queue, payload, status, enqueued_at) VALUES (?1, ?2, 'PENDING', ?3)",
                params![queue.as_str(), json, to_millis(Utc::now())],
            )?;
            conn.last_insert_rowid()
        };
        self.notifiers[queue.index()].notify_one();
        Ok(id)
    }

    fn claim_next(&self, queue: QueueName) -> Result<Option<QueueMessage>> {
        let conn = self.conn.lock().unwrap();
        let message = conn
            .query_row(
                r#"UPDATE job_queue SET status = 'IN_PROGRESS', claimed_at = ?2
                   WHERE id = (
                       SELECT id FROM job_queue
                       WHERE queue = ?1 AND status = 'PENDING'
                       ORDER BY id LIMIT 1
                   )
                   RETURNING id, payload, enqueued_at"#,
                params![queue.as_str(), to_millis(Utc::now())],
                |row| {
                    Ok(QueueMessage {
                        id: row.get(0)?,
                        queue,
                        payload: row.get(1)?,
                        enqueued_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(message)
    }

    fn complete(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM job_queue WHERE id = ?1", [id])?;
        Ok(())
    }

    fn purge(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM job_queue", [])?)
    }

    fn pending_count(&self, queue: QueueName) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_queue WHERE queue = ?1 AND status = 'PENDING'",
            [queue.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn notifier(&self, queue: QueueName) -> Arc<Notify> {
        Arc::clone(&self.notifiers[queue.index()])
    }
}
