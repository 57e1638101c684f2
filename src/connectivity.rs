//! Online/offline state machine with debounced reconnect notifications.
//!
//! The host application forwards the platform connectivity signal into
//! `set_online`/`set_offline`; feature code may also force transitions
//! explicitly (e.g. entering airplane mode ahead of a trip). Subscribers get
//! one `Reconnected` per offline-to-online transition. A flapping link is
//! absorbed two ways: repeated signals in the same state do nothing, and a
//! transition landing within the debounce window of the previous reconnect
//! does not re-notify.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::event::ConnectivityEvent;

/// Link state as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
  Online,
  Offline,
}

struct MonitorState {
  link: LinkState,
  last_reconnect: Option<Instant>,
}

// A poisoned state still holds a coherent LinkState; recover the guard.
fn lock(mutex: &Mutex<MonitorState>) -> std::sync::MutexGuard<'_, MonitorState> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks connectivity and publishes transition events.
pub struct ConnectivityMonitor {
  state: Mutex<MonitorState>,
  events: broadcast::Sender<ConnectivityEvent>,
  debounce: Duration,
}

impl ConnectivityMonitor {
  pub fn new(debounce: Duration) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      state: Mutex::new(MonitorState {
        link: LinkState::Online,
        last_reconnect: None,
      }),
      events,
      debounce,
    }
  }

  /// Subscribe to connectivity transitions.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.events.subscribe()
  }

  pub fn is_offline(&self) -> bool {
    self.link_state() == LinkState::Offline
  }

  pub fn link_state(&self) -> LinkState {
    lock(&self.state).link
  }

  /// Report the link as up. No-op when already online.
  pub fn set_online(&self) {
    let mut state = lock(&self.state);
    if state.link == LinkState::Online {
      return;
    }
    state.link = LinkState::Online;

    // Suppress the notification (but keep the state change) when the link
    // is flapping; a sync pass is already underway or just finished.
    let debounced = state
      .last_reconnect
      .map(|at| at.elapsed() < self.debounce)
      .unwrap_or(false);
    if !debounced {
      state.last_reconnect = Some(Instant::now());
      let _ = self.events.send(ConnectivityEvent::Reconnected);
    }
  }

  /// Report the link as down. No-op when already offline. Writes already in
  /// flight are not cancelled; they settle on their own.
  pub fn set_offline(&self) {
    let mut state = lock(&self.state);
    if state.link == LinkState::Offline {
      return;
    }
    state.link = LinkState::Offline;
    let _ = self.events.send(ConnectivityEvent::Disconnected);
  }
}
