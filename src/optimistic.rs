//! Per-key optimistic updates with rollback.
//!
//! Feature modules (carpool assignment, medication dosing, incident
//! reporting) want instant UI feedback regardless of network latency. An
//! `execute` call applies the state change synchronously, then settles it
//! against whatever the API layer reports: confirmed, failed (roll back), or
//! queued for later replay (keep the optimistic state, mark it provisional).
//!
//! The optimistic closure runs to completion before the network call is
//! dispatched, so callers can repaint from the mutated state before any
//! await. Exactly one of `on_success`/`rollback` runs per call.

use color_eyre::Report;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// How the API layer settled an optimistic write.
#[derive(Debug)]
pub enum ApiOutcome<T> {
  /// The server confirmed the write and returned its authoritative result.
  Confirmed(T),
  /// The write was queued for later replay (client offline). Treated as a
  /// deferred success, not a failure.
  Queued,
}

/// How an `execute` call settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticStatus {
  /// Server confirmed; `on_success` ran with the result.
  Confirmed,
  /// Write queued offline; optimistic state retained and the key marked
  /// pending-sync so the UI can show provisional state.
  Deferred,
}

#[derive(Debug, Error)]
pub enum OptimisticError {
  /// A second `execute` with a key that is still in flight. The first
  /// operation is untouched; the caller should retry after it settles.
  #[error("operation '{key}' is already in flight")]
  InFlight { key: String },
  /// The API call failed. Rollback has already run by the time this is
  /// returned.
  #[error("{0}")]
  Api(Report),
}

/// Serializes optimistic operations per key and tracks provisional state.
#[derive(Default)]
pub struct OptimisticCoordinator {
  in_flight: Mutex<HashSet<String>>,
  pending_sync: Mutex<HashSet<String>>,
}

// A poisoned key set is still structurally sound; recover the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OptimisticCoordinator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run one optimistic operation.
  ///
  /// - `optimistic` mutates in-memory state immediately and returns a
  ///   rollback snapshot; it has run before this function first awaits.
  /// - `api` performs the write against the network/API boundary.
  /// - `on_success` runs with the server result (typically replacing
  ///   optimistic state with a server-confirmed refetch).
  /// - `rollback` runs with the snapshot if the API call fails; the error
  ///   is then returned to the caller.
  pub async fn execute<Snap, T, Api, Fut>(
    &self,
    key: &str,
    optimistic: impl FnOnce() -> Snap,
    api: Api,
    on_success: impl FnOnce(T),
    rollback: impl FnOnce(Snap),
  ) -> Result<OptimisticStatus, OptimisticError>
  where
    Api: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<ApiOutcome<T>>>,
  {
    if !lock(&self.in_flight).insert(key.to_string()) {
      return Err(OptimisticError::InFlight {
        key: key.to_string(),
      });
    }

    let result = self.settle(key, optimistic, api, on_success, rollback).await;
    lock(&self.in_flight).remove(key);
    result
  }

  async fn settle<Snap, T, Api, Fut>(
    &self,
    key: &str,
    optimistic: impl FnOnce() -> Snap,
    api: Api,
    on_success: impl FnOnce(T),
    rollback: impl FnOnce(Snap),
  ) -> Result<OptimisticStatus, OptimisticError>
  where
    Api: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<ApiOutcome<T>>>,
  {
    let snapshot = optimistic();

    match api().await {
      Ok(ApiOutcome::Confirmed(result)) => {
        // The server's answer supersedes any provisional marker left over
        // from an earlier queued write to the same key
        lock(&self.pending_sync).remove(key);
        on_success(result);
        Ok(OptimisticStatus::Confirmed)
      }
      Ok(ApiOutcome::Queued) => {
        tracing::debug!(key, "write queued offline; keeping optimistic state");
        lock(&self.pending_sync).insert(key.to_string());
        Ok(OptimisticStatus::Deferred)
      }
      Err(error) => {
        rollback(snapshot);
        Err(OptimisticError::Api(error))
      }
    }
  }

  /// Keys whose optimistic state is still awaiting replay confirmation.
  pub fn pending_keys(&self) -> Vec<String> {
    lock(&self.pending_sync).iter().cloned().collect()
  }

  /// Whether a key's state is provisional.
  pub fn is_pending(&self, key: &str) -> bool {
    lock(&self.pending_sync).contains(key)
  }

  /// Clear a provisional marker, e.g. after a sync cycle replayed the
  /// queued write or the entity was refetched from the server.
  pub fn clear_pending(&self, key: &str) {
    lock(&self.pending_sync).remove(key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::Arc;
  use std::time::Duration;

  fn coordinator() -> OptimisticCoordinator {
    OptimisticCoordinator::new()
  }

  #[tokio::test]
  async fn test_success_runs_optimistic_then_success_never_rollback() {
    let coordinator = coordinator();
    let log = Arc::new(Mutex::new(Vec::new()));

    let status = coordinator
      .execute(
        "assign-9-14",
        {
          let log = Arc::clone(&log);
          move || {
            log.lock().unwrap().push("optimistic");
            "snapshot"
          }
        },
        {
          let log = Arc::clone(&log);
          move || {
            log.lock().unwrap().push("api");
            async { Ok(ApiOutcome::Confirmed(42)) }
          }
        },
        {
          let log = Arc::clone(&log);
          move |result| {
            assert_eq!(result, 42);
            log.lock().unwrap().push("success");
          }
        },
        {
          let log = Arc::clone(&log);
          move |_snapshot| {
            log.lock().unwrap().push("rollback");
          }
        },
      )
      .await
      .unwrap();

    assert_eq!(status, OptimisticStatus::Confirmed);
    // Optimistic ran synchronously before the api call, success exactly
    // once, rollback never
    assert_eq!(
      *log.lock().unwrap(),
      vec!["optimistic", "api", "success"]
    );
    assert!(!coordinator.is_pending("assign-9-14"));
  }

  #[tokio::test]
  async fn test_failure_rolls_back_with_original_snapshot() {
    let coordinator = coordinator();
    let state = Arc::new(Mutex::new(vec![1, 2, 3]));

    let result: Result<OptimisticStatus, OptimisticError> = coordinator
      .execute(
        "dose-7",
        {
          let state = Arc::clone(&state);
          move || {
            let mut state = state.lock().unwrap();
            let before = state.clone();
            state.push(4); // the optimistic change
            before
          }
        },
        || async { Err(eyre!("500 from server")) },
        |_: ()| panic!("on_success must not run"),
        {
          let state = Arc::clone(&state);
          move |before| {
            *state.lock().unwrap() = before;
          }
        },
      )
      .await;

    // Pre-call state restored bit-for-bit, error surfaced after rollback
    assert_eq!(*state.lock().unwrap(), vec![1, 2, 3]);
    assert!(matches!(result, Err(OptimisticError::Api(_))));
  }

  #[tokio::test]
  async fn test_queued_write_is_deferred_success() {
    let coordinator = coordinator();
    let state = Arc::new(Mutex::new(0));

    let status = coordinator
      .execute(
        "incident-3",
        {
          let state = Arc::clone(&state);
          move || {
            *state.lock().unwrap() = 7;
            0
          }
        },
        || async { Ok(ApiOutcome::<()>::Queued) },
        |_| panic!("on_success must not run for a queued write"),
        |_| panic!("rollback must not run for a queued write"),
      )
      .await
      .unwrap();

    assert_eq!(status, OptimisticStatus::Deferred);
    // Optimistic state retained, key marked provisional
    assert_eq!(*state.lock().unwrap(), 7);
    assert!(coordinator.is_pending("incident-3"));
    assert_eq!(coordinator.pending_keys(), vec!["incident-3".to_string()]);
  }

  #[tokio::test]
  async fn test_second_execute_on_in_flight_key_is_rejected() {
    let coordinator = Arc::new(coordinator());

    let first = tokio::spawn({
      let coordinator = Arc::clone(&coordinator);
      async move {
        coordinator
          .execute(
            "assign-9-14",
            || (),
            || async {
              tokio::time::sleep(Duration::from_millis(100)).await;
              Ok(ApiOutcome::Confirmed(()))
            },
            |_| {},
            |_| {},
          )
          .await
      }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Same key: rejected without touching the first operation
    let second = coordinator
      .execute(
        "assign-9-14",
        || panic!("optimistic must not run for a rejected call"),
        || async { Ok(ApiOutcome::Confirmed(())) },
        |_: ()| {},
        |_: ()| {},
      )
      .await;
    assert!(matches!(
      second,
      Err(OptimisticError::InFlight { ref key }) if key == "assign-9-14"
    ));

    // Different key: unaffected
    let other = coordinator
      .execute(
        "assign-2-5",
        || (),
        || async { Ok(ApiOutcome::Confirmed(())) },
        |_| {},
        |_| {},
      )
      .await;
    assert!(other.is_ok());

    first.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_key_is_reusable_after_settling() {
    let coordinator = coordinator();

    for _ in 0..2 {
      coordinator
        .execute(
          "assign-9-14",
          || (),
          || async { Ok(ApiOutcome::Confirmed(())) },
          |_| {},
          |_| {},
        )
        .await
        .unwrap();
    }

    // Even a failed operation releases the key
    let failed = coordinator
      .execute(
        "assign-9-14",
        || (),
        || async { Err(eyre!("boom")) },
        |_: ()| {},
        |_| {},
      )
      .await;
    assert!(failed.is_err());

    let again = coordinator
      .execute(
        "assign-9-14",
        || (),
        || async { Ok(ApiOutcome::Confirmed(())) },
        |_| {},
        |_| {},
      )
      .await;
    assert!(again.is_ok());
  }

  #[tokio::test]
  async fn test_confirmed_write_clears_stale_pending_marker() {
    let coordinator = coordinator();

    coordinator
      .execute(
        "dose-7",
        || (),
        || async { Ok(ApiOutcome::<()>::Queued) },
        |_| {},
        |_| {},
      )
      .await
      .unwrap();
    assert!(coordinator.is_pending("dose-7"));

    coordinator
      .execute(
        "dose-7",
        || (),
        || async { Ok(ApiOutcome::Confirmed(())) },
        |_| {},
        |_| {},
      )
      .await
      .unwrap();
    assert!(!coordinator.is_pending("dose-7"));
  }
}
