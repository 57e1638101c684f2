//! Offline-first synchronization engine for troop-management apps.
//!
//! The engine lets a client keep working with no network: reads degrade to
//! a local TTL cache, writes queue durably and replay in order once
//! connectivity returns, optimistic updates give instant UI feedback with
//! automatic rollback, and "camp mode" pre-caches whole date ranges ahead
//! of a known offline window.
//!
//! Everything is protocol-agnostic: the engine queues, replays and caches
//! opaque JSON operations addressed by endpoint-derived keys. The host
//! application supplies the HTTP transport ([`remote::ApiClient`]), the
//! auth token source ([`remote::TokenProvider`]), the platform connectivity
//! signal, and optionally a background-sync facility
//! ([`sync::BackgroundSync`]).
//!
//! ```ignore
//! let config = SyncConfig::load(None)?;
//! let api = Arc::new(HttpClient::new(&config.server, Arc::new(EnvTokenProvider))?);
//! let engine = SyncEngine::new(&config, api, Arc::new(EnvTokenProvider), None)?;
//! engine.start();
//!
//! // Reads: network-first, cache-fallback
//! let roster = engine.reader().fetch_json(&ResourceKey::new("/api/roster")).await?;
//!
//! // Writes while offline queue durably and replay on reconnect
//! engine.queue().enqueue(&PendingMutation::structured(
//!   "assign-9-14", "POST", "/api/carpool/assign", vec![], Some(body),
//! ))?;
//! ```

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod event;
pub mod optimistic;
pub mod prepare;
pub mod queue;
pub mod remote;
pub mod sync;

pub use cache::{CacheEntry, CacheStore, ResourceKey};
pub use config::SyncConfig;
pub use connectivity::ConnectivityMonitor;
pub use engine::SyncEngine;
pub use event::{ConnectivityEvent, SyncEvent};
pub use optimistic::{ApiOutcome, OptimisticCoordinator, OptimisticError, OptimisticStatus};
pub use prepare::{BulkPreparer, PreparedWindow, PrepareProgress, PrepareStatus};
pub use queue::{MutationQueue, PendingMutation, QueuedWrite};
pub use remote::{ApiClient, CachedRemote, ReadError, ReadResult, ReadSource, TokenProvider};
pub use sync::{BackgroundSync, SyncCoordinator, SyncOutcome, SyncReport};
