//! Network-first reads with cache fallback.
//!
//! This is the read path feature modules call. While online it fetches from
//! the server and writes through to the cache; when the network is gone (or
//! merely failing) it degrades to the last good cache entry, expired or not.
//! Days inside an active prepared window are served straight from the
//! fan-out entries without touching the network at all.

use chrono::{DateTime, Utc};
use color_eyre::eyre::eyre;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cache::{CacheEntry, CacheStore, ResourceKey};
use crate::connectivity::ConnectivityMonitor;
use crate::prepare::WindowStore;

use super::client::{ApiClient, ApiRequest};

/// Where a read's data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
  /// Fresh from the network
  Network,
  /// From cache, within its TTL
  CacheFresh,
  /// From cache past its TTL, served as a degradation path
  CacheStale,
}

/// A successful read.
#[derive(Debug, Clone)]
pub struct ReadResult {
  pub data: Value,
  pub source: ReadSource,
  /// When the data was cached; `None` for network reads
  pub stored_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ReadError {
  /// Offline with nothing cached under the key. A specific empty state the
  /// UI can render, distinct from a generic failure.
  #[error("data unavailable offline: {key}")]
  UnavailableOffline { key: String },
  /// Network or storage failure with no cached fallback.
  #[error("{0}")]
  Other(color_eyre::Report),
}

/// Network-first reader over the cache store.
pub struct CachedRemote {
  api: Arc<dyn ApiClient>,
  cache: CacheStore,
  connectivity: Arc<ConnectivityMonitor>,
  windows: WindowStore,
  default_ttl: Duration,
}

impl CachedRemote {
  pub fn new(
    api: Arc<dyn ApiClient>,
    cache: CacheStore,
    connectivity: Arc<ConnectivityMonitor>,
    windows: WindowStore,
    default_ttl: Duration,
  ) -> Self {
    Self {
      api,
      cache,
      connectivity,
      windows,
      default_ttl,
    }
  }

  /// Read a resource.
  ///
  /// 1. A day inside an active prepared window is served from cache
  ///    directly (camp mode; the bulk preparer already fetched it).
  /// 2. Offline: serve the cache ignoring expiration, or report
  ///    `UnavailableOffline`.
  /// 3. Online: fetch, cache, return. On network failure fall back to the
  ///    last good entry, expired or not.
  pub async fn fetch_json(&self, key: &ResourceKey) -> Result<ReadResult, ReadError> {
    let hash = key.cache_hash();

    if self.day_is_prepared(key)? {
      if let Some(entry) = self
        .cache
        .get_ignoring_expiration(&hash)
        .map_err(ReadError::Other)?
      {
        return Ok(from_entry(entry));
      }
      // Prepared window but this resource was not in the bundle; fall
      // through to the ordinary path
    }

    if self.connectivity.is_offline() {
      return match self
        .cache
        .get_ignoring_expiration(&hash)
        .map_err(ReadError::Other)?
      {
        Some(entry) => Ok(from_entry(entry)),
        None => Err(ReadError::UnavailableOffline {
          key: key.description(),
        }),
      };
    }

    match self.fetch_network(key).await {
      Ok(data) => {
        self
          .cache
          .set(&hash, &data, self.default_ttl)
          .map_err(ReadError::Other)?;
        Ok(ReadResult {
          data,
          source: ReadSource::Network,
          stored_at: None,
        })
      }
      Err(network_error) => {
        tracing::debug!(
          key = %key.description(),
          "network read failed, falling back to cache: {}",
          network_error
        );
        match self
          .cache
          .get_ignoring_expiration(&hash)
          .map_err(ReadError::Other)?
        {
          Some(entry) => Ok(from_entry(entry)),
          None => Err(ReadError::Other(network_error)),
        }
      }
    }
  }

  async fn fetch_network(&self, key: &ResourceKey) -> color_eyre::Result<Value> {
    let response = self.api.fetch(ApiRequest::get(key.request_path())).await?;

    if !response.is_success() {
      return Err(eyre!(
        "Read of {} failed with status {}",
        key.description(),
        response.status
      ));
    }
    // A 200 whose body is not JSON (captive portal, HTML error page served
    // with a success status) must never be written to the cache
    if !response.is_json() {
      return Err(eyre!(
        "Non-JSON response ({:?}) for {}",
        response.content_type,
        key.description()
      ));
    }

    response.json()
  }

  fn day_is_prepared(&self, key: &ResourceKey) -> Result<bool, ReadError> {
    match key.day() {
      Some(day) => self.windows.is_date_prepared(day).map_err(ReadError::Other),
      None => Ok(false),
    }
  }
}

fn from_entry(entry: CacheEntry) -> ReadResult {
  let source = if entry.is_expired() {
    ReadSource::CacheStale
  } else {
    ReadSource::CacheFresh
  };
  ReadResult {
    data: entry.payload,
    source,
    stored_at: Some(entry.stored_at),
  }
}
