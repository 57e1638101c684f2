//! The sync coordinator: drains the mutation queue once connectivity
//! returns.

use color_eyre::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::event::SyncEvent;
use crate::queue::MutationQueue;
use crate::remote::{ApiClient, TokenProvider};

use super::strategy::{
  BackgroundSync, DelegatedSync, DirectReplaySync, ReplayContext, ReplayDisposition,
  ReplayStrategy,
};
use super::{SyncOutcome, SyncReport};

/// Replays queued mutations against the server.
///
/// `sync_pending` is idempotent and safe to call from several places at
/// once; a busy flag makes concurrent invocations no-ops so a flapping link
/// or an eager caller cannot start duplicate replay passes.
pub struct SyncCoordinator {
  queue: MutationQueue,
  api: Arc<dyn ApiClient>,
  tokens: Arc<dyn TokenProvider>,
  batch_endpoint: String,
  strategies: Vec<Arc<dyn ReplayStrategy>>,
  busy: AtomicBool,
  events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
  pub fn new(
    queue: MutationQueue,
    api: Arc<dyn ApiClient>,
    tokens: Arc<dyn TokenProvider>,
    batch_endpoint: String,
    grace_period: Duration,
    background: Option<Arc<dyn BackgroundSync>>,
  ) -> Self {
    // Strategy order is the runtime capability detection: delegated first
    // when a facility exists, direct replay as the fallback that always
    // reaches a conclusion.
    let mut strategies: Vec<Arc<dyn ReplayStrategy>> = Vec::new();
    if let Some(facility) = background {
      strategies.push(Arc::new(DelegatedSync::new(facility, grace_period)));
    }
    strategies.push(Arc::new(DirectReplaySync));

    let (events, _) = broadcast::channel(64);

    Self {
      queue,
      api,
      tokens,
      batch_endpoint,
      strategies,
      busy: AtomicBool::new(false),
      events,
    }
  }

  /// Subscribe to sync progress and outcome events.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// Mutations still waiting for replay.
  pub fn pending_count(&self) -> Result<usize> {
    self.queue.len()
  }

  /// Drain the pending queue. A call while another is running does nothing.
  pub async fn sync_pending(&self) -> Result<SyncOutcome> {
    if self
      .busy
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      tracing::debug!("sync already in progress; ignoring");
      return Ok(SyncOutcome::AlreadyRunning);
    }

    let result = self.run_cycle().await;
    self.busy.store(false, Ordering::SeqCst);
    result
  }

  async fn run_cycle(&self) -> Result<SyncOutcome> {
    let _ = self.events.send(SyncEvent::Started);

    let ctx = ReplayContext {
      queue: self.queue.clone(),
      api: Arc::clone(&self.api),
      tokens: Arc::clone(&self.tokens),
      batch_endpoint: self.batch_endpoint.clone(),
      events: self.events.clone(),
    };

    let mut outcome = SyncOutcome::Completed(SyncReport::default());
    for strategy in &self.strategies {
      match strategy.replay(&ctx).await {
        Ok(ReplayDisposition::Delegated) => {
          tracing::info!("replay delegated to background sync");
          outcome = SyncOutcome::Delegated;
          break;
        }
        Ok(ReplayDisposition::Completed(report)) => {
          tracing::info!(
            replayed = report.replayed,
            rejected = report.rejected,
            retained = report.retained,
            "sync cycle finished"
          );
          outcome = SyncOutcome::Completed(report);
          break;
        }
        Ok(ReplayDisposition::Unconfirmed) => {
          tracing::debug!(strategy = strategy.name(), "no confirmation; falling back");
        }
        Err(e) => {
          tracing::warn!(strategy = strategy.name(), "replay failed: {}", e);
          return Err(e);
        }
      }
    }

    let remaining = self.queue.len()?;
    let _ = self.events.send(SyncEvent::PendingCount(remaining));
    if let SyncOutcome::Completed(report) = &outcome {
      let _ = self.events.send(SyncEvent::Completed {
        replayed: report.replayed,
        rejected: report.rejected,
        remaining,
      });
    }

    Ok(outcome)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::queue::PendingMutation;
  use crate::remote::{ApiRequest, ApiResponse, StaticTokenProvider};
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::Mutex;

  /// Scripted API: answers by URL substring, records every request.
  struct ScriptedApi {
    requests: Mutex<Vec<ApiRequest>>,
    respond: Box<dyn Fn(&ApiRequest) -> ApiResponse + Send + Sync>,
    delay: Duration,
  }

  impl ScriptedApi {
    fn ok() -> Arc<Self> {
      Self::with(|_| json_response(200))
    }

    fn with(respond: impl Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static) -> Arc<Self> {
      Arc::new(Self {
        requests: Mutex::new(Vec::new()),
        respond: Box::new(respond),
        delay: Duration::ZERO,
      })
    }

    fn slow(delay: Duration) -> Arc<Self> {
      Arc::new(Self {
        requests: Mutex::new(Vec::new()),
        respond: Box::new(|_| json_response(200)),
        delay,
      })
    }

    fn urls(&self) -> Vec<String> {
      self
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.url.clone())
        .collect()
    }
  }

  #[async_trait]
  impl ApiClient for ScriptedApi {
    async fn fetch(&self, request: ApiRequest) -> Result<ApiResponse> {
      if self.delay > Duration::ZERO {
        tokio::time::sleep(self.delay).await;
      }
      let response = (self.respond)(&request);
      self.requests.lock().unwrap().push(request);
      Ok(response)
    }
  }

  fn json_response(status: u16) -> ApiResponse {
    ApiResponse {
      status,
      content_type: Some("application/json".to_string()),
      body: b"{}".to_vec(),
    }
  }

  fn coordinator_with(
    api: Arc<ScriptedApi>,
    background: Option<Arc<dyn BackgroundSync>>,
  ) -> (SyncCoordinator, MutationQueue) {
    let queue = MutationQueue::new(Database::open_in_memory().unwrap());
    let coordinator = SyncCoordinator::new(
      queue.clone(),
      api,
      Arc::new(StaticTokenProvider("rotated".to_string())),
      "/api/sync/batch".to_string(),
      Duration::from_millis(50),
      background,
    );
    (coordinator, queue)
  }

  fn structured(key: &str, url: &str) -> PendingMutation {
    PendingMutation::structured(key, "POST", url, vec![], None)
  }

  #[tokio::test]
  async fn test_replay_preserves_enqueue_order() {
    let api = ScriptedApi::ok();
    let (coordinator, queue) = coordinator_with(api.clone(), None);

    queue.enqueue(&structured("m1", "/api/attendance/1")).unwrap();
    queue.enqueue(&structured("m2", "/api/attendance/1")).unwrap();

    coordinator.sync_pending().await.unwrap();

    assert_eq!(api.urls(), vec!["/api/attendance/1", "/api/attendance/1"]);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_client_error_discards_and_reports() {
    let api = ScriptedApi::with(|request| {
      if request.url.contains("medications") {
        json_response(422)
      } else {
        json_response(200)
      }
    });
    let (coordinator, queue) = coordinator_with(api.clone(), None);
    let mut events = coordinator.subscribe();

    queue.enqueue(&structured("bad", "/api/medications/9")).unwrap();
    queue.enqueue(&structured("good", "/api/carpool/4")).unwrap();

    let outcome = coordinator.sync_pending().await.unwrap();
    let report = match outcome {
      SyncOutcome::Completed(report) => report,
      _ => panic!("expected a completed direct replay"),
    };
    assert_eq!(report.rejected, 1);
    assert_eq!(report.replayed, 1);
    assert!(queue.is_empty().unwrap());

    // A second pass must not see the rejected mutation again
    coordinator.sync_pending().await.unwrap();
    assert_eq!(api.urls().len(), 2);

    let received: Vec<SyncEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(received.contains(&SyncEvent::MutationRejected {
      key: "bad".to_string(),
      status: 422,
    }));
  }

  #[tokio::test]
  async fn test_transient_failure_keeps_mutation_queued() {
    let api = ScriptedApi::with(|_| json_response(503));
    let (coordinator, queue) = coordinator_with(api, None);

    queue.enqueue(&structured("m", "/api/incidents")).unwrap();

    let outcome = coordinator.sync_pending().await.unwrap();
    match outcome {
      SyncOutcome::Completed(report) => assert_eq!(report.retained, 1),
      _ => panic!("expected a completed direct replay"),
    }
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_legacy_entries_drain_as_one_batch_after_individual_replays() {
    let api = ScriptedApi::ok();
    let (coordinator, queue) = coordinator_with(api.clone(), None);

    queue
      .enqueue(&PendingMutation::legacy("l1", "dose-recorded", json!({"id": 1})))
      .unwrap();
    queue.enqueue(&structured("s1", "/api/carpool/4")).unwrap();
    queue
      .enqueue(&PendingMutation::legacy("l2", "dose-recorded", json!({"id": 2})))
      .unwrap();

    coordinator.sync_pending().await.unwrap();

    // One request for the structured entry, then exactly one aggregate call
    let urls = api.urls();
    assert_eq!(urls, vec!["/api/carpool/4", "/api/sync/batch"]);

    let requests = api.requests.lock().unwrap();
    let batch: serde_json::Value =
      serde_json::from_slice(requests[1].body.as_ref().unwrap()).unwrap();
    assert_eq!(batch["operations"].as_array().unwrap().len(), 2);
    drop(requests);

    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_replay_stamps_fresh_authorization() {
    let api = ScriptedApi::ok();
    let (coordinator, queue) = coordinator_with(api.clone(), None);

    queue
      .enqueue(&PendingMutation::structured(
        "m",
        "POST",
        "/api/attendance",
        vec![("Authorization".to_string(), "Bearer stale".to_string())],
        None,
      ))
      .unwrap();

    coordinator.sync_pending().await.unwrap();

    let requests = api.requests.lock().unwrap();
    let auth: Vec<&(String, String)> = requests[0]
      .headers
      .iter()
      .filter(|(name, _)| name.eq_ignore_ascii_case("authorization"))
      .collect();
    assert_eq!(auth.len(), 1);
    assert_eq!(auth[0].1, "Bearer rotated");
  }

  #[tokio::test]
  async fn test_concurrent_sync_is_a_noop() {
    let api = ScriptedApi::slow(Duration::from_millis(100));
    let (coordinator, queue) = coordinator_with(api, None);
    queue.enqueue(&structured("m", "/api/attendance")).unwrap();

    let coordinator = Arc::new(coordinator);
    let first = tokio::spawn({
      let coordinator = Arc::clone(&coordinator);
      async move { coordinator.sync_pending().await.unwrap() }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = coordinator.sync_pending().await.unwrap();
    assert!(matches!(second, SyncOutcome::AlreadyRunning));

    let first = first.await.unwrap();
    assert!(matches!(first, SyncOutcome::Completed(_)));
  }

  struct ConfirmingFacility;

  #[async_trait]
  impl BackgroundSync for ConfirmingFacility {
    async fn is_available(&self) -> bool {
      true
    }

    async fn dispatch(&self) -> Result<bool> {
      Ok(true)
    }
  }

  struct StalledFacility;

  #[async_trait]
  impl BackgroundSync for StalledFacility {
    async fn is_available(&self) -> bool {
      true
    }

    async fn dispatch(&self) -> Result<bool> {
      // Never confirms within any grace period
      tokio::time::sleep(Duration::from_secs(3600)).await;
      Ok(true)
    }
  }

  #[tokio::test]
  async fn test_available_facility_takes_the_replay() {
    let api = ScriptedApi::ok();
    let (coordinator, queue) = coordinator_with(api.clone(), Some(Arc::new(ConfirmingFacility)));
    queue.enqueue(&structured("m", "/api/attendance")).unwrap();

    let outcome = coordinator.sync_pending().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Delegated));
    // Nothing replayed directly
    assert!(api.urls().is_empty());
  }

  #[tokio::test]
  async fn test_stalled_facility_falls_back_to_direct_replay() {
    let api = ScriptedApi::ok();
    let (coordinator, queue) = coordinator_with(api.clone(), Some(Arc::new(StalledFacility)));
    queue.enqueue(&structured("m", "/api/attendance")).unwrap();

    let outcome = coordinator.sync_pending().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed(_)));
    assert_eq!(api.urls(), vec!["/api/attendance"]);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_pending_count_published_after_cycle() {
    let api = ScriptedApi::with(|_| json_response(503));
    let (coordinator, queue) = coordinator_with(api, None);
    let mut events = coordinator.subscribe();

    queue.enqueue(&structured("m", "/api/attendance")).unwrap();
    coordinator.sync_pending().await.unwrap();

    let received: Vec<SyncEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(received.contains(&SyncEvent::PendingCount(1)));
  }
}
