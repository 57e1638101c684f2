//! HTTP fetch primitive and auth token seam.
//!
//! The engine never talks to reqwest directly; everything goes through the
//! `ApiClient` trait so tests (and the host application, if it has its own
//! transport) can substitute implementations.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::config::ServerConfig;

/// A request the engine wants executed against the API server.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: String,
  /// Path relative to the configured base URL (absolute URLs from replayed
  /// mutations are passed through untouched)
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl ApiRequest {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      method: "GET".to_string(),
      url: url.into(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
    Self {
      method: "POST".to_string(),
      url: url.into(),
      headers: vec![(
        "Content-Type".to_string(),
        "application/json".to_string(),
      )],
      body: Some(body.to_string().into_bytes()),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Replace any existing Authorization header with a fresh bearer token.
  /// Replayed mutations may have been queued under a token that has since
  /// rotated.
  pub fn with_fresh_authorization(mut self, token: &str) -> Self {
    self
      .headers
      .retain(|(name, _)| !name.eq_ignore_ascii_case("authorization"));
    self
      .headers
      .push(("Authorization".to_string(), format!("Bearer {}", token)));
    self
  }
}

/// The server's answer, reduced to what the engine needs.
#[derive(Debug, Clone)]
pub struct ApiResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl ApiResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// 4xx: the server understood the request and refused it. Retrying an
  /// identical request can never succeed.
  pub fn is_client_error(&self) -> bool {
    (400..500).contains(&self.status)
  }

  /// Whether the declared content type is JSON. A 200 serving HTML (captive
  /// portals, error pages) must not be mistaken for data.
  pub fn is_json(&self) -> bool {
    self
      .content_type
      .as_deref()
      .map(|ct| {
        let essence = ct.split(';').next().unwrap_or(ct).trim();
        essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
      })
      .unwrap_or(false)
  }

  pub fn json(&self) -> Result<Value> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }
}

/// Authenticated HTTP fetch.
#[async_trait]
pub trait ApiClient: Send + Sync {
  async fn fetch(&self, request: ApiRequest) -> Result<ApiResponse>;
}

/// Current-user auth token accessor. Consulted at send time, never cached by
/// the engine, because tokens rotate while mutations sit in the queue.
pub trait TokenProvider: Send + Sync {
  fn bearer_token(&self) -> Option<String>;
}

/// Token provider backed by environment variables.
///
/// Checks TRAILSYNC_API_TOKEN first, then TRAILHQ_API_TOKEN as fallback.
pub struct EnvTokenProvider;

impl TokenProvider for EnvTokenProvider {
  fn bearer_token(&self) -> Option<String> {
    std::env::var("TRAILSYNC_API_TOKEN")
      .or_else(|_| std::env::var("TRAILHQ_API_TOKEN"))
      .ok()
  }
}

/// Fixed token, for tests and embedded hosts that manage auth themselves.
pub struct StaticTokenProvider(pub String);

impl TokenProvider for StaticTokenProvider {
  fn bearer_token(&self) -> Option<String> {
    Some(self.0.clone())
  }
}

/// reqwest-backed `ApiClient`.
pub struct HttpClient {
  client: reqwest::Client,
  base_url: Url,
  tokens: Arc<dyn TokenProvider>,
}

impl HttpClient {
  pub fn new(server: &ServerConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
    let base_url = Url::parse(&server.base_url)
      .map_err(|e| eyre!("Invalid base URL {}: {}", server.base_url, e))?;

    Ok(Self {
      client: reqwest::Client::new(),
      base_url,
      tokens,
    })
  }
}

#[async_trait]
impl ApiClient for HttpClient {
  async fn fetch(&self, request: ApiRequest) -> Result<ApiResponse> {
    let url = self
      .base_url
      .join(&request.url)
      .map_err(|e| eyre!("Invalid request URL {}: {}", request.url, e))?;

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid HTTP method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, url);

    let mut has_authorization = false;
    for (name, value) in &request.headers {
      if name.eq_ignore_ascii_case("authorization") {
        has_authorization = true;
      }
      builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_authorization {
      if let Some(token) = self.tokens.bearer_token() {
        builder = builder.bearer_auth(token);
      }
    }

    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Request failed: {}", e))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body: {}", e))?
      .to_vec();

    Ok(ApiResponse {
      status,
      content_type,
      body,
    })
  }
}
