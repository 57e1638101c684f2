//! The engine facade.
//!
//! One explicitly constructed `SyncEngine` per process wires the cache,
//! queue, connectivity monitor, sync coordinator, optimistic coordinator and
//! bulk preparer together, and owns the background task that turns
//! reconnect events into sync cycles. Nothing here is a global; tests build
//! as many isolated engines as they like.

use color_eyre::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::event::{ConnectivityEvent, SyncEvent};
use crate::optimistic::OptimisticCoordinator;
use crate::prepare::{BulkPreparer, WindowStore};
use crate::queue::MutationQueue;
use crate::remote::{ApiClient, CachedRemote, TokenProvider};
use crate::sync::{BackgroundSync, SyncCoordinator, SyncOutcome};

/// The offline-first sync engine.
pub struct SyncEngine {
  connectivity: Arc<ConnectivityMonitor>,
  cache: CacheStore,
  queue: MutationQueue,
  coordinator: Arc<SyncCoordinator>,
  optimistic: Arc<OptimisticCoordinator>,
  preparer: Arc<BulkPreparer>,
  reader: Arc<CachedRemote>,
  listener: Mutex<Option<JoinHandle<()>>>,
  stop: Arc<Notify>,
}

impl SyncEngine {
  /// Build an engine with durable state at the configured (or platform
  /// default) location.
  pub fn new(
    config: &SyncConfig,
    api: Arc<dyn ApiClient>,
    tokens: Arc<dyn TokenProvider>,
    background: Option<Arc<dyn BackgroundSync>>,
  ) -> Result<Self> {
    let db = match &config.data_dir {
      Some(dir) => Database::open(&dir.join("sync.db"))?,
      None => Database::open_default()?,
    };
    Self::with_database(config, db, api, tokens, background)
  }

  /// Build an engine over an explicit database. Tests use in-memory.
  pub fn with_database(
    config: &SyncConfig,
    db: Database,
    api: Arc<dyn ApiClient>,
    tokens: Arc<dyn TokenProvider>,
    background: Option<Arc<dyn BackgroundSync>>,
  ) -> Result<Self> {
    let cache = CacheStore::new(db.clone());
    let queue = MutationQueue::new(db.clone());
    let windows = WindowStore::new(db);
    let connectivity = Arc::new(ConnectivityMonitor::new(config.sync.debounce()));

    let coordinator = Arc::new(SyncCoordinator::new(
      queue.clone(),
      Arc::clone(&api),
      tokens,
      config.server.batch_endpoint.clone(),
      config.sync.grace_period(),
      background,
    ));

    let preparer = Arc::new(BulkPreparer::new(
      Arc::clone(&api),
      cache.clone(),
      windows.clone(),
      config.server.bundle_endpoint.clone(),
      config.cache.prepared_ttl(),
      config.prepare.max_window_age_days,
    ));

    let reader = Arc::new(CachedRemote::new(
      api,
      cache.clone(),
      Arc::clone(&connectivity),
      windows,
      config.cache.default_ttl(),
    ));

    Ok(Self {
      connectivity,
      cache,
      queue,
      coordinator,
      optimistic: Arc::new(OptimisticCoordinator::new()),
      preparer,
      reader,
      listener: Mutex::new(None),
      stop: Arc::new(Notify::new()),
    })
  }

  /// Spawn the reconnect listener: each `Reconnected` event triggers a sync
  /// cycle. Calling `start` again while the listener runs is a no-op.
  pub fn start(&self) {
    let mut listener = self
      .listener
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    if listener.is_some() {
      return;
    }

    let mut events = self.connectivity.subscribe();
    let coordinator = Arc::clone(&self.coordinator);
    let stop = Arc::clone(&self.stop);

    *listener = Some(tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = stop.notified() => break,
          event = events.recv() => match event {
            Ok(ConnectivityEvent::Reconnected) => {
              if let Err(e) = coordinator.sync_pending().await {
                tracing::warn!("reconnect sync failed: {}", e);
              }
            }
            Ok(ConnectivityEvent::Disconnected) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
          },
        }
      }
    }));
  }

  /// Stop the reconnect listener and wait for it to wind down. A sync cycle
  /// already underway finishes first; in-flight replays are never cancelled
  /// mid-request.
  pub async fn shutdown(&self) {
    let handle = {
      let mut listener = self
        .listener
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      listener.take()
    };

    if let Some(handle) = handle {
      self.stop.notify_one();
      let _ = handle.await;
    }
  }

  /// Trigger a sync cycle now (a cycle already running makes this a no-op).
  pub async fn sync_now(&self) -> Result<SyncOutcome> {
    self.coordinator.sync_pending().await
  }

  /// Subscribe to sync progress and outcome events.
  pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.coordinator.subscribe()
  }

  pub fn cache(&self) -> &CacheStore {
    &self.cache
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  pub fn optimistic(&self) -> &OptimisticCoordinator {
    &self.optimistic
  }

  pub fn preparer(&self) -> &BulkPreparer {
    &self.preparer
  }

  pub fn reader(&self) -> &CachedRemote {
    &self.reader
  }
}
