//! Camp-mode bulk preparation.
//!
//! Ahead of a known offline window (a week at summer camp), the preparer
//! fetches one consolidated payload for the whole date range and fans it out
//! into the per-resource, per-day cache entries feature modules ordinarily
//! read. Feature code never knows a bulk prepare happened; it finds the
//! entries under the same keys a network-first read would have written.
//!
//! Windows auto-expire: once today is past the end date (or the window
//! outlives the configured maximum age) cached entries revert to ordinary
//! TTL policy.

use chrono::{DateTime, NaiveDate, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{parse_datetime, CacheStore, ResourceKey};
use crate::db::Database;
use crate::remote::{ApiClient, ApiRequest};

/// A multi-day period whose data has been pre-cached for offline use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedWindow {
  pub id: String,
  pub scope: String,
  pub start_date: NaiveDate,
  pub end_date: NaiveDate,
  pub prepared_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl PreparedWindow {
  /// Every day in the window, inclusive.
  pub fn dates(&self) -> Vec<NaiveDate> {
    self
      .start_date
      .iter_days()
      .take_while(|day| *day <= self.end_date)
      .collect()
  }

  pub fn covers(&self, day: NaiveDate) -> bool {
    self.start_date <= day && day <= self.end_date
  }

  /// A window stops counting once today is past its end date or it has
  /// outlived its maximum age.
  pub fn is_active(&self, today: NaiveDate, now: DateTime<Utc>) -> bool {
    today <= self.end_date && now < self.expires_at
  }
}

/// Durable store of prepared windows.
#[derive(Clone)]
pub struct WindowStore {
  db: Database,
}

impl WindowStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Insert or replace a window (re-preparing the same range refreshes it).
  pub fn upsert(&self, window: &PreparedWindow) -> Result<()> {
    self
      .db
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO prepared_windows
         (id, scope, start_date, end_date, prepared_at, expires_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          window.id,
          window.scope,
          window.start_date.format("%Y-%m-%d").to_string(),
          window.end_date.format("%Y-%m-%d").to_string(),
          window.prepared_at.to_rfc3339(),
          window.expires_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store prepared window: {}", e))?;

    Ok(())
  }

  /// All windows still worth consulting. Dead windows are dropped from the
  /// store as a side effect.
  pub fn active_windows(&self) -> Result<Vec<PreparedWindow>> {
    let all = self.list()?;
    let today = Utc::now().date_naive();
    let now = Utc::now();

    let (active, dead): (Vec<_>, Vec<_>) =
      all.into_iter().partition(|w| w.is_active(today, now));

    for window in &dead {
      self
        .db
        .lock()?
        .execute(
          "DELETE FROM prepared_windows WHERE id = ?",
          params![window.id],
        )
        .map_err(|e| eyre!("Failed to drop expired window: {}", e))?;
    }

    Ok(active)
  }

  /// Whether some active window covers this day.
  pub fn is_date_prepared(&self, day: NaiveDate) -> Result<bool> {
    Ok(self.active_windows()?.iter().any(|w| w.covers(day)))
  }

  fn list(&self) -> Result<Vec<PreparedWindow>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, scope, start_date, end_date, prepared_at, expires_at
         FROM prepared_windows",
      )
      .map_err(|e| eyre!("Failed to prepare window query: {}", e))?;

    let rows: Vec<(String, String, String, String, String, String)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list windows: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read window row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, scope, start, end, prepared_at, expires_at)| {
        Ok(PreparedWindow {
          id,
          scope,
          start_date: parse_date(&start)?,
          end_date: parse_date(&end)?,
          prepared_at: parse_datetime(&prepared_at)?,
          expires_at: parse_datetime(&expires_at)?,
        })
      })
      .collect()
  }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| eyre!("Failed to parse date '{}': {}", s, e))
}

/// Bulk-prepare progress, observable while a prepare runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareProgress {
  pub status: PrepareStatus,
  /// Cache entries written so far; increases monotonically within a run
  pub steps_done: u32,
  pub steps_total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareStatus {
  Idle,
  Preparing,
  Complete,
  Error,
}

/// Expands a date range into daily cache entries from one consolidated
/// fetch.
pub struct BulkPreparer {
  api: Arc<dyn ApiClient>,
  cache: CacheStore,
  windows: WindowStore,
  bundle_endpoint: String,
  prepared_ttl: Duration,
  max_window_age_days: u32,
  progress: Mutex<PrepareProgress>,
}

impl BulkPreparer {
  pub fn new(
    api: Arc<dyn ApiClient>,
    cache: CacheStore,
    windows: WindowStore,
    bundle_endpoint: String,
    prepared_ttl: Duration,
    max_window_age_days: u32,
  ) -> Self {
    Self {
      api,
      cache,
      windows,
      bundle_endpoint,
      prepared_ttl,
      max_window_age_days,
      progress: Mutex::new(PrepareProgress {
        status: PrepareStatus::Idle,
        steps_done: 0,
        steps_total: 0,
      }),
    }
  }

  /// Fetch everything the scope needs for `[start_date, end_date]` and fan
  /// it out into per-day cache entries with the extended TTL.
  ///
  /// The consolidated response maps days to endpoint payloads:
  /// `{"days": {"2026-07-01": {"/api/attendance": ..., "/api/medications": ...}}}`
  pub async fn prepare_window(
    &self,
    scope: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
  ) -> Result<PreparedWindow> {
    if end_date < start_date {
      return Err(eyre!(
        "Window ends ({}) before it starts ({})",
        end_date,
        start_date
      ));
    }

    self.set_progress(PrepareStatus::Preparing, 0, 0);

    match self.fetch_and_fan_out(scope, start_date, end_date).await {
      Ok(window) => {
        let done = self.progress().steps_done;
        self.set_progress(PrepareStatus::Complete, done, done);
        tracing::info!(
          scope,
          %start_date,
          %end_date,
          entries = done,
          "offline window prepared"
        );
        Ok(window)
      }
      Err(e) => {
        let progress = self.progress();
        self.set_progress(PrepareStatus::Error, progress.steps_done, progress.steps_total);
        Err(e)
      }
    }
  }

  async fn fetch_and_fan_out(
    &self,
    scope: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
  ) -> Result<PreparedWindow> {
    let request = ApiRequest::get(
      ResourceKey::new(&self.bundle_endpoint)
        .with_param("scope", scope)
        .with_param("start", start_date.format("%Y-%m-%d").to_string())
        .with_param("end", end_date.format("%Y-%m-%d").to_string())
        .request_path(),
    );

    let response = self.api.fetch(request).await?;
    if !response.is_success() {
      return Err(eyre!("Bundle fetch failed with status {}", response.status));
    }
    if !response.is_json() {
      return Err(eyre!(
        "Bundle fetch returned non-JSON content type {:?}",
        response.content_type
      ));
    }

    let bundle = response.json()?;
    let days = bundle
      .get("days")
      .and_then(Value::as_object)
      .ok_or_else(|| eyre!("Bundle response has no 'days' object"))?;

    let steps_total: usize = days
      .values()
      .filter_map(Value::as_object)
      .map(|resources| resources.len())
      .sum();
    self.set_progress(PrepareStatus::Preparing, 0, steps_total as u32);

    let mut steps_done = 0u32;
    for (day_text, resources) in days {
      let day = parse_date(day_text)?;
      if day < start_date || day > end_date {
        tracing::warn!(day = %day, "bundle contained a day outside the window; skipping");
        continue;
      }
      let resources = resources
        .as_object()
        .ok_or_else(|| eyre!("Bundle day {} is not an object", day_text))?;

      for (endpoint, payload) in resources {
        let key = ResourceKey::for_day(endpoint.clone(), scope, day);
        self
          .cache
          .set(&key.cache_hash(), payload, self.prepared_ttl)?;
        steps_done += 1;
        self.set_progress(PrepareStatus::Preparing, steps_done, steps_total as u32);
      }
    }

    let now = Utc::now();
    let window = PreparedWindow {
      id: format!("{}:{}:{}", scope, start_date, end_date),
      scope: scope.to_string(),
      start_date,
      end_date,
      prepared_at: now,
      expires_at: now + chrono::Duration::days(i64::from(self.max_window_age_days)),
    };
    self.windows.upsert(&window)?;

    Ok(window)
  }

  /// Current progress snapshot, for rendering an indicator.
  pub fn progress(&self) -> PrepareProgress {
    *lock_progress(&self.progress)
  }

  /// Whether some active prepared window covers this day.
  pub fn is_date_prepared(&self, day: NaiveDate) -> Result<bool> {
    self.windows.is_date_prepared(day)
  }

  fn set_progress(&self, status: PrepareStatus, steps_done: u32, steps_total: u32) {
    *lock_progress(&self.progress) = PrepareProgress {
      status,
      steps_done,
      steps_total,
    };
  }
}

// Progress is plain data; recover the guard on poisoning.
fn lock_progress(mutex: &Mutex<PrepareProgress>) -> std::sync::MutexGuard<'_, PrepareProgress> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use crate::remote::ApiResponse;
  use serde_json::json;

  struct BundleApi {
    response: ApiResponse,
  }

  #[async_trait]
  impl ApiClient for BundleApi {
    async fn fetch(&self, _request: ApiRequest) -> Result<ApiResponse> {
      Ok(self.response.clone())
    }
  }

  fn json_response(body: Value) -> ApiResponse {
    ApiResponse {
      status: 200,
      content_type: Some("application/json".to_string()),
      body: body.to_string().into_bytes(),
    }
  }

  fn preparer_with(response: ApiResponse) -> (BulkPreparer, CacheStore, WindowStore) {
    let db = Database::open_in_memory().unwrap();
    let cache = CacheStore::new(db.clone());
    let windows = WindowStore::new(db);
    let preparer = BulkPreparer::new(
      Arc::new(BundleApi { response }),
      cache.clone(),
      windows.clone(),
      "/api/offline/bundle".to_string(),
      Duration::from_secs(14 * 24 * 3600),
      30,
    );
    (preparer, cache, windows)
  }

  fn day(offset: i64) -> NaiveDate {
    Utc::now().date_naive() + chrono::Duration::days(offset)
  }

  fn fmt(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
  }

  #[tokio::test]
  async fn test_fan_out_writes_one_entry_per_resource_per_day() {
    let (start, end) = (day(0), day(2));
    let mut days = serde_json::Map::new();
    for offset in 0..3 {
      days.insert(
        fmt(day(offset)),
        json!({
          "/api/attendance": {"present": [offset]},
          "/api/medications": {"doses": []},
        }),
      );
    }
    let (preparer, cache, _) = preparer_with(json_response(json!({ "days": days })));

    let window = preparer.prepare_window("camp", start, end).await.unwrap();

    assert_eq!(window.dates().len(), 3);
    for offset in 0..3 {
      for endpoint in ["/api/attendance", "/api/medications"] {
        let key = ResourceKey::for_day(endpoint, "camp", day(offset));
        let entry = cache.get(&key.cache_hash()).unwrap();
        assert!(entry.is_some(), "missing entry for {} on day {}", endpoint, offset);
      }
    }

    let progress = preparer.progress();
    assert_eq!(progress.status, PrepareStatus::Complete);
    assert_eq!(progress.steps_done, 6);
    assert_eq!(progress.steps_total, 6);
  }

  #[tokio::test]
  async fn test_is_date_prepared_inside_and_outside_window() {
    let (preparer, _, _) = preparer_with(json_response(json!({
      "days": { fmt(day(1)): {"/api/attendance": {}} }
    })));

    preparer.prepare_window("camp", day(0), day(2)).await.unwrap();

    assert!(preparer.is_date_prepared(day(1)).unwrap());
    assert!(!preparer.is_date_prepared(day(4)).unwrap());
  }

  #[tokio::test]
  async fn test_non_json_bundle_is_an_error_and_nothing_is_cached() {
    let (preparer, cache, _) = preparer_with(ApiResponse {
      status: 200,
      content_type: Some("text/html".to_string()),
      body: b"<html>sign in</html>".to_vec(),
    });

    let result = preparer.prepare_window("camp", day(0), day(1)).await;

    assert!(result.is_err());
    assert_eq!(preparer.progress().status, PrepareStatus::Error);
    let key = ResourceKey::for_day("/api/attendance", "camp", day(0));
    assert!(cache.get_ignoring_expiration(&key.cache_hash()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_window_past_its_end_date_is_inactive() {
    let db = Database::open_in_memory().unwrap();
    let windows = WindowStore::new(db);
    let now = Utc::now();

    windows
      .upsert(&PreparedWindow {
        id: "camp:past".to_string(),
        scope: "camp".to_string(),
        start_date: day(-5),
        end_date: day(-2),
        prepared_at: now - chrono::Duration::days(5),
        expires_at: now + chrono::Duration::days(25),
      })
      .unwrap();

    // The window covered day(-3) but today is past its end date
    assert!(!windows.is_date_prepared(day(-3)).unwrap());
  }

  #[tokio::test]
  async fn test_window_beyond_max_age_is_inactive() {
    let db = Database::open_in_memory().unwrap();
    let windows = WindowStore::new(db);
    let now = Utc::now();

    windows
      .upsert(&PreparedWindow {
        id: "camp:aged".to_string(),
        scope: "camp".to_string(),
        start_date: day(-1),
        end_date: day(10),
        prepared_at: now - chrono::Duration::days(31),
        expires_at: now - chrono::Duration::days(1),
      })
      .unwrap();

    assert!(!windows.is_date_prepared(day(2)).unwrap());
    // Dead windows are dropped from the store
    assert!(windows.active_windows().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_windows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let (start, end) = (day(0), day(2));

    {
      let windows = WindowStore::new(Database::open(&path).unwrap());
      let now = Utc::now();
      windows
        .upsert(&PreparedWindow {
          id: "camp:live".to_string(),
          scope: "camp".to_string(),
          start_date: start,
          end_date: end,
          prepared_at: now,
          expires_at: now + chrono::Duration::days(30),
        })
        .unwrap();
    }

    let windows = WindowStore::new(Database::open(&path).unwrap());
    assert!(windows.is_date_prepared(day(1)).unwrap());
  }

  #[tokio::test]
  async fn test_inverted_range_is_rejected() {
    let (preparer, _, _) = preparer_with(json_response(json!({"days": {}})));
    let result = preparer.prepare_window("camp", day(2), day(0)).await;
    assert!(result.is_err());
  }
}
