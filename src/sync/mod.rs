//! Queue replay once connectivity returns.
//!
//! The coordinator picks a replay strategy at runtime: hand off to a
//! privileged background-sync facility when one is available and answers
//! within the grace period, otherwise replay the queue directly. Direct
//! replay distinguishes transient failures (mutation stays queued) from
//! permanent rejections (discarded and surfaced), and drains legacy-format
//! entries as one aggregate call.

mod coordinator;
mod strategy;

pub use coordinator::SyncCoordinator;
pub use strategy::{
  BackgroundSync, DelegatedSync, DirectReplaySync, ReplayContext, ReplayDisposition,
  ReplayStrategy,
};

/// Counts from one direct replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Applied by the server
  pub replayed: usize,
  /// Refused with a 4xx; discarded, never retried
  pub rejected: usize,
  /// Transient failures; still queued
  pub retained: usize,
}

/// How a `sync_pending` call concluded.
#[derive(Debug, Clone, Copy)]
pub enum SyncOutcome {
  /// Direct replay ran to completion.
  Completed(SyncReport),
  /// The background facility took the replay.
  Delegated,
  /// Another cycle was already running; nothing was done.
  AlreadyRunning,
}
