//! TTL cache store backed by SQLite.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::time::Duration;

use crate::db::Database;

/// A cached payload with its storage metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  /// The cached JSON payload
  pub payload: Value,
  /// When the entry was written
  pub stored_at: DateTime<Utc>,
  /// When the entry stops being served by strict reads
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Whether the entry has outlived its TTL.
  pub fn is_expired(&self) -> bool {
    self.expires_at < Utc::now()
  }
}

/// Key/value store with explicit expiration.
///
/// Writes are atomic replace-by-key and last-write-wins; concurrent writers
/// to the same key never merge. Strict reads (`get`) treat an expired entry
/// as a miss; `get_ignoring_expiration` is the offline degradation path and
/// returns whatever is stored regardless of expiry.
#[derive(Clone)]
pub struct CacheStore {
  db: Database,
}

impl CacheStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Get a payload, treating absent and expired entries as a miss.
  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    Ok(self.read(key)?.filter(|entry| !entry.is_expired()))
  }

  /// Get a payload regardless of expiry. Used only when serving stale data
  /// beats serving nothing: the caller is offline or inside a prepared
  /// window.
  pub fn get_ignoring_expiration(&self, key: &str) -> Result<Option<CacheEntry>> {
    self.read(key)
  }

  /// Store a payload under `key` with the given TTL, replacing any previous
  /// entry unconditionally.
  pub fn set(&self, key: &str, payload: &Value, ttl: Duration) -> Result<()> {
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| eyre!("TTL out of range: {}", e))?;
    let data = serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    self
      .db
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, payload, stored_at, expires_at)
         VALUES (?, ?, ?, ?)",
        params![key, data, now.to_rfc3339(), (now + ttl).to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  /// Remove an entry. Removing a missing key is not an error.
  pub fn delete(&self, key: &str) -> Result<()> {
    self
      .db
      .lock()?
      .execute("DELETE FROM cache_entries WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(())
  }

  /// Drop every entry whose TTL has passed. Returns the number removed.
  /// Housekeeping only; strict reads already treat expired entries as
  /// misses.
  pub fn purge_expired(&self) -> Result<usize> {
    let removed = self
      .db
      .lock()?
      .execute(
        "DELETE FROM cache_entries WHERE expires_at < ?",
        params![Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to purge cache: {}", e))?;

    Ok(removed)
  }

  fn read(&self, key: &str) -> Result<Option<CacheEntry>> {
    let row: Option<(Vec<u8>, String, String)> = self
      .db
      .lock()?
      .query_row(
        "SELECT payload, stored_at, expires_at FROM cache_entries WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((data, stored_at, expires_at)) => {
        let payload = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize cached payload: {}", e))?;
        Ok(Some(CacheEntry {
          payload,
          stored_at: parse_datetime(&stored_at)?,
          expires_at: parse_datetime(&expires_at)?,
        }))
      }
      None => Ok(None),
    }
  }
}

/// Parse an RFC 3339 timestamp stored by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
