//! Durable queue of writes attempted while offline.
//!
//! Mutations survive process restart and replay in enqueue order. Two wire
//! shapes exist in old installs, so the record is a tagged variant resolved
//! once at dequeue time: the current format carries a full HTTP request, the
//! legacy format carries an action name plus opaque data and is drained as a
//! single aggregate call by the sync coordinator.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::Database;

/// A queued write operation destined for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  /// Queue key, unique per logical write (e.g. "carpool-assign-9-14")
  pub key: String,
  /// When the write was queued
  pub enqueued_at: DateTime<Utc>,
  #[serde(flatten)]
  pub write: QueuedWrite,
}

/// The two queued-write formats, discriminated explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum QueuedWrite {
  /// Current format: a fully described request, replayed individually with
  /// a fresh Authorization header.
  Structured {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
  },
  /// Legacy format from older clients: an action name plus opaque payload.
  /// Accumulated and sent as one aggregate request on sync.
  Legacy { action: String, data: Value },
}

impl PendingMutation {
  /// Queue a current-format write.
  pub fn structured(
    key: impl Into<String>,
    method: impl Into<String>,
    url: impl Into<String>,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
  ) -> Self {
    Self {
      key: key.into(),
      enqueued_at: Utc::now(),
      write: QueuedWrite::Structured {
        url: url.into(),
        method: method.into(),
        headers,
        body,
      },
    }
  }

  /// Queue a legacy-format write.
  pub fn legacy(key: impl Into<String>, action: impl Into<String>, data: Value) -> Self {
    Self {
      key: key.into(),
      enqueued_at: Utc::now(),
      write: QueuedWrite::Legacy {
        action: action.into(),
        data,
      },
    }
  }
}

/// FIFO mutation queue persisted in SQLite.
#[derive(Clone)]
pub struct MutationQueue {
  db: Database,
}

impl MutationQueue {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Append a mutation. Re-enqueueing an existing key replaces the old
  /// record and moves it to the back of the queue: the newest intent for a
  /// logical write is the one worth replaying.
  pub fn enqueue(&self, mutation: &PendingMutation) -> Result<()> {
    let record =
      serde_json::to_vec(mutation).map_err(|e| eyre!("Failed to serialize mutation: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "DELETE FROM pending_mutations WHERE queue_key = ?",
        params![mutation.key],
      )
      .map_err(|e| eyre!("Failed to clear replaced mutation: {}", e))?;
    conn
      .execute(
        "INSERT INTO pending_mutations (queue_key, record, enqueued_at)
         VALUES (?, ?, ?)",
        params![mutation.key, record, mutation.enqueued_at.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    Ok(())
  }

  /// All pending mutations in enqueue order.
  pub fn list(&self) -> Result<Vec<PendingMutation>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT record FROM pending_mutations ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let records: Vec<Vec<u8>> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list queue: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    records
      .iter()
      .map(|data| {
        serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize mutation: {}", e))
      })
      .collect()
  }

  /// Remove a mutation by key. Returns whether anything was removed.
  pub fn remove(&self, key: &str) -> Result<bool> {
    let removed = self
      .db
      .lock()?
      .execute(
        "DELETE FROM pending_mutations WHERE queue_key = ?",
        params![key],
      )
      .map_err(|e| eyre!("Failed to remove mutation: {}", e))?;

    Ok(removed > 0)
  }

  /// Number of pending mutations.
  pub fn len(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .lock()?
      .query_row("SELECT count(*) FROM pending_mutations", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queue: {}", e))?;

    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}
