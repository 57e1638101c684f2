//! Deterministic cache addressing for logical resources.
//!
//! Reads, the mutation queue and the bulk preparer must all agree on how a
//! resource is addressed, so keys are derived from the endpoint path plus
//! normalized query parameters and hashed to a stable, fixed-length form.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Logical identifier of a cacheable resource: an endpoint path plus its
/// query parameters, optionally pinned to a calendar day.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceKey {
  endpoint: String,
  params: Vec<(String, String)>,
  day: Option<NaiveDate>,
}

impl ResourceKey {
  /// Key for a plain endpoint, e.g. "/api/roster".
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      params: Vec::new(),
      day: None,
    }
  }

  /// Add a query parameter.
  pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.params.push((name.into(), value.into()));
    self
  }

  /// Key for a per-day resource inside a scope, e.g. attendance for one
  /// troop on one date. This is the addressing the bulk preparer uses when
  /// fanning a window out, so ordinary reads find the prepared entries.
  pub fn for_day(endpoint: impl Into<String>, scope: &str, day: NaiveDate) -> Self {
    Self::new(endpoint)
      .with_param("scope", scope)
      .with_param("date", day.format("%Y-%m-%d").to_string())
      .pinned_to(day)
  }

  /// Pin this key to a calendar day so the read policy can consult
  /// prepared-window state for it.
  pub fn pinned_to(mut self, day: NaiveDate) -> Self {
    self.day = Some(day);
    self
  }

  /// The calendar day this key is pinned to, if any.
  pub fn day(&self) -> Option<NaiveDate> {
    self.day
  }

  /// Request path for the network fetch, e.g. "/api/attendance?date=...".
  /// Uses the same canonical parameter ordering as the hash so equal keys
  /// issue equal requests.
  pub fn request_path(&self) -> String {
    if self.params.is_empty() {
      return self.endpoint.clone();
    }

    let mut sorted = self.params.clone();
    sorted.sort();

    let query: String = url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(sorted.iter().map(|(k, v)| (k.as_str(), v.as_str())))
      .finish();

    format!("{}?{}", self.endpoint, query)
  }

  /// Stable cache key: SHA256 over the normalized endpoint + parameters.
  pub fn cache_hash(&self) -> String {
    let mut sorted = self.params.clone();
    sorted.sort();

    let mut input = self.endpoint.trim().to_lowercase();
    for (name, value) in &sorted {
      input.push('&');
      input.push_str(name);
      input.push('=');
      input.push_str(value);
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Human-readable form for logging.
  pub fn description(&self) -> String {
    self.request_path()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parameter_order_does_not_change_hash() {
    let a = ResourceKey::new("/api/attendance")
      .with_param("scope", "troop-12")
      .with_param("date", "2026-07-01");
    let b = ResourceKey::new("/api/attendance")
      .with_param("date", "2026-07-01")
      .with_param("scope", "troop-12");

    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_endpoint_case_and_whitespace_normalized() {
    let a = ResourceKey::new("/API/Roster ");
    let b = ResourceKey::new("/api/roster");

    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_distinct_resources_get_distinct_hashes() {
    let a = ResourceKey::new("/api/roster");
    let b = ResourceKey::new("/api/medications");

    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_for_day_pins_the_date_and_agrees_with_manual_keys() {
    let day = NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
    let prepared = ResourceKey::for_day("/api/attendance", "troop-12", day);
    let manual = ResourceKey::new("/api/attendance")
      .with_param("date", "2026-07-01")
      .with_param("scope", "troop-12");

    assert_eq!(prepared.day(), Some(day));
    assert_eq!(prepared.cache_hash(), manual.cache_hash());
  }

  #[test]
  fn test_request_path_is_canonical() {
    let key = ResourceKey::new("/api/attendance")
      .with_param("scope", "troop 12")
      .with_param("date", "2026-07-01");

    assert_eq!(
      key.request_path(),
      "/api/attendance?date=2026-07-01&scope=troop+12"
    );
  }
}
