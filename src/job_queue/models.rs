//! Queue names and message payloads.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five logical queues workers consume from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    Archive,
    Download,
    Restore,
    LibraryScan,
    LibrarySync,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Archive,
        QueueName::Download,
        QueueName::Restore,
        QueueName::LibraryScan,
        QueueName::LibrarySync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Archive => "archive",
            QueueName::Download => "download",
            QueueName::Restore => "restore",
            QueueName::LibraryScan => "library_scan",
            QueueName::LibrarySync => "library_sync",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        QueueName::ALL.into_iter().find(|q| q.as_str() == s)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body: item queues carry a media path, library queues a library id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePayload {
    MediaPath(String),
    LibraryId(i64),
}

impl QueuePayload {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode queue payload")
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).with_context(|| format!("Invalid queue payload: {}", s))
    }
}

/// A message claimed from the queue for processing.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: i64,
    pub queue: QueueName,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn decode_payload(&self) -> Result<QueuePayload> {
        QueuePayload::from_json(&self.payload)
    }
}
