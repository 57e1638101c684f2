//! Replay strategies: delegated background sync with direct-replay fallback.

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::event::SyncEvent;
use crate::queue::{MutationQueue, QueuedWrite};
use crate::remote::{ApiClient, ApiRequest, TokenProvider};

use super::SyncReport;

/// Everything a strategy needs for one replay pass.
pub struct ReplayContext {
  pub queue: MutationQueue,
  pub api: Arc<dyn ApiClient>,
  pub tokens: Arc<dyn TokenProvider>,
  /// Aggregate endpoint for legacy-format writes
  pub batch_endpoint: String,
  pub events: broadcast::Sender<SyncEvent>,
}

/// What a replay attempt concluded.
pub enum ReplayDisposition {
  /// Replay ran to completion here, with these outcomes.
  Completed(SyncReport),
  /// The background facility confirmed it is handling replay.
  Delegated,
  /// This strategy could not confirm progress; try the next one.
  Unconfirmed,
}

/// A way of getting the pending queue replayed.
#[async_trait]
pub trait ReplayStrategy: Send + Sync {
  fn name(&self) -> &'static str;
  async fn replay(&self, ctx: &ReplayContext) -> Result<ReplayDisposition>;
}

/// Privileged background-sync facility, when the platform offers one. It can
/// wake independently of the app and invoke replay on its own schedule.
#[async_trait]
pub trait BackgroundSync: Send + Sync {
  /// Whether the facility is present and reachable right now.
  async fn is_available(&self) -> bool;
  /// Ask the facility to run a replay pass. Resolves `true` once it reports
  /// progress, `false` if it refused the request.
  async fn dispatch(&self) -> Result<bool>;
}

/// Hand replay to the background facility and wait a bounded grace period
/// for it to confirm. Anything other than a confirmation within the grace
/// period reports `Unconfirmed` so the coordinator falls back to direct
/// replay.
pub struct DelegatedSync {
  facility: Arc<dyn BackgroundSync>,
  grace_period: Duration,
}

impl DelegatedSync {
  pub fn new(facility: Arc<dyn BackgroundSync>, grace_period: Duration) -> Self {
    Self {
      facility,
      grace_period,
    }
  }
}

#[async_trait]
impl ReplayStrategy for DelegatedSync {
  fn name(&self) -> &'static str {
    "delegated"
  }

  async fn replay(&self, _ctx: &ReplayContext) -> Result<ReplayDisposition> {
    if !self.facility.is_available().await {
      return Ok(ReplayDisposition::Unconfirmed);
    }

    match tokio::time::timeout(self.grace_period, self.facility.dispatch()).await {
      Ok(Ok(true)) => Ok(ReplayDisposition::Delegated),
      Ok(Ok(false)) => Ok(ReplayDisposition::Unconfirmed),
      Ok(Err(e)) => {
        tracing::debug!("background sync dispatch failed: {}", e);
        Ok(ReplayDisposition::Unconfirmed)
      }
      Err(_) => {
        tracing::debug!(
          "background sync gave no confirmation within {:?}",
          self.grace_period
        );
        Ok(ReplayDisposition::Unconfirmed)
      }
    }
  }
}

/// Replay the queue ourselves, one mutation at a time.
///
/// Structured entries replay individually with a fresh Authorization header;
/// legacy entries accumulate and drain as one aggregate request after the
/// individual replays. A mutation leaves the queue only on a definitive
/// outcome: 2xx success, or a 4xx rejection that can never succeed on retry.
pub struct DirectReplaySync;

#[async_trait]
impl ReplayStrategy for DirectReplaySync {
  fn name(&self) -> &'static str {
    "direct"
  }

  async fn replay(&self, ctx: &ReplayContext) -> Result<ReplayDisposition> {
    let pending = ctx.queue.list()?;
    let mut report = SyncReport::default();
    let mut batch: Vec<(String, String, serde_json::Value)> = Vec::new();

    // Sequential on purpose: concurrent replays of writes against the same
    // resource would race each other server-side.
    for mutation in pending {
      match mutation.write {
        QueuedWrite::Structured {
          url,
          method,
          headers,
          body,
        } => {
          let mut request = ApiRequest {
            method,
            url,
            headers,
            body,
          };
          if let Some(token) = ctx.tokens.bearer_token() {
            request = request.with_fresh_authorization(&token);
          }

          match ctx.api.fetch(request).await {
            Ok(response) if response.is_success() => {
              ctx.queue.remove(&mutation.key)?;
              report.replayed += 1;
            }
            Ok(response) if response.is_client_error() => {
              // Permanently unresolvable; keeping it would block the queue
              // forever. Discard and surface.
              ctx.queue.remove(&mutation.key)?;
              report.rejected += 1;
              tracing::warn!(
                key = %mutation.key,
                status = response.status,
                "queued change rejected by server; discarding"
              );
              let _ = ctx.events.send(SyncEvent::MutationRejected {
                key: mutation.key.clone(),
                status: response.status,
              });
            }
            Ok(_) | Err(_) => {
              // Transient; stays queued for the next cycle
              report.retained += 1;
            }
          }
        }
        QueuedWrite::Legacy { action, data } => {
          batch.push((mutation.key.clone(), action, data));
        }
      }
    }

    if !batch.is_empty() {
      self.replay_batch(ctx, &batch, &mut report).await?;
    }

    Ok(ReplayDisposition::Completed(report))
  }
}

impl DirectReplaySync {
  /// One aggregate request for all accumulated legacy entries, instead of a
  /// write storm of N point updates on reconnect.
  async fn replay_batch(
    &self,
    ctx: &ReplayContext,
    batch: &[(String, String, serde_json::Value)],
    report: &mut SyncReport,
  ) -> Result<()> {
    let payload = json!({
      "operations": batch
        .iter()
        .map(|(_, action, data)| json!({"action": action, "data": data}))
        .collect::<Vec<_>>(),
    });

    let mut request = ApiRequest::post_json(&ctx.batch_endpoint, &payload);
    if let Some(token) = ctx.tokens.bearer_token() {
      request = request.with_fresh_authorization(&token);
    }

    match ctx.api.fetch(request).await {
      Ok(response) if response.is_success() => {
        for (key, _, _) in batch {
          ctx.queue.remove(key)?;
          report.replayed += 1;
        }
      }
      Ok(response) if response.is_client_error() => {
        tracing::warn!(
          status = response.status,
          count = batch.len(),
          "legacy batch rejected by server; discarding members"
        );
        for (key, _, _) in batch {
          ctx.queue.remove(key)?;
          report.rejected += 1;
          let _ = ctx.events.send(SyncEvent::MutationRejected {
            key: key.clone(),
            status: response.status,
          });
        }
      }
      Ok(_) | Err(_) => {
        report.retained += batch.len();
      }
    }

    Ok(())
  }
}
