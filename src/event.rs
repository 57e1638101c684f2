//! Typed events published by the engine.
//!
//! Subscribers receive these over tokio broadcast channels: subscribe, then
//! receive zero or more notifications. Lagging receivers drop the oldest
//! events rather than blocking publishers.

/// Connectivity transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  /// The link came back after being offline. Emitted once per transition,
  /// not per underlying network blip.
  Reconnected,
  /// The link went away. No queue action is taken at this point.
  Disconnected,
}

/// Sync-cycle progress and outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// A sync cycle began draining the queue.
  Started,
  /// A sync cycle finished.
  Completed {
    replayed: usize,
    rejected: usize,
    remaining: usize,
  },
  /// A queued mutation was refused by the server and will never be
  /// retried. The UI should tell the user the change was not applied.
  MutationRejected { key: String, status: u16 },
  /// The pending-mutation count changed.
  PendingCount(usize),
}
