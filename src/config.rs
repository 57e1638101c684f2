use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  pub server: ServerConfig,
  /// Where the engine database lives (default: platform data dir)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncTuning,
  #[serde(default)]
  pub prepare: PrepareConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Base URL of the API server, e.g. "https://app.trailhq.org"
  pub base_url: String,
  /// Aggregate endpoint for legacy-format queued writes
  #[serde(default = "default_batch_endpoint")]
  pub batch_endpoint: String,
  /// Consolidated endpoint the bulk preparer fetches a whole window from
  #[serde(default = "default_bundle_endpoint")]
  pub bundle_endpoint: String,
}

fn default_batch_endpoint() -> String {
  "/api/sync/batch".to_string()
}

fn default_bundle_endpoint() -> String {
  "/api/offline/bundle".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// TTL for ordinary cached reads (volatile resources)
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: u64,
  /// TTL for entries written by the bulk preparer (camp mode)
  #[serde(default = "default_prepared_ttl_secs")]
  pub prepared_ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
  300 // 5 minutes
}

fn default_prepared_ttl_secs() -> u64 {
  14 * 24 * 3600 // two weeks, long enough to cover any camp
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: default_ttl_secs(),
      prepared_ttl_secs: default_prepared_ttl_secs(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_secs)
  }

  pub fn prepared_ttl(&self) -> Duration {
    Duration::from_secs(self.prepared_ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncTuning {
  /// Minimum gap between reconnect notifications (absorbs link flapping)
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  /// How long to wait for the background-sync facility to confirm progress
  /// before falling back to direct replay
  #[serde(default = "default_grace_period_ms")]
  pub grace_period_ms: u64,
}

fn default_debounce_ms() -> u64 {
  2_000
}

fn default_grace_period_ms() -> u64 {
  5_000
}

impl Default for SyncTuning {
  fn default() -> Self {
    Self {
      debounce_ms: default_debounce_ms(),
      grace_period_ms: default_grace_period_ms(),
    }
  }
}

impl SyncTuning {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn grace_period(&self) -> Duration {
    Duration::from_millis(self.grace_period_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrepareConfig {
  /// A prepared window is dropped this many days after it was created, even
  /// if its date range has not passed yet
  #[serde(default = "default_max_window_age_days")]
  pub max_window_age_days: u32,
}

fn default_max_window_age_days() -> u32 {
  30
}

impl Default for PrepareConfig {
  fn default() -> Self {
    Self {
      max_window_age_days: default_max_window_age_days(),
    }
  }
}

impl SyncConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./trailsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/trailsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/trailsync/config.yaml"
      )),
    }
  }

  /// Build a configuration with defaults for everything except the server.
  pub fn for_server(base_url: impl Into<String>) -> Self {
    Self {
      server: ServerConfig {
        base_url: base_url.into(),
        batch_endpoint: default_batch_endpoint(),
        bundle_endpoint: default_bundle_endpoint(),
      },
      data_dir: None,
      cache: CacheConfig::default(),
      sync: SyncTuning::default(),
      prepare: PrepareConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("trailsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("trailsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: SyncConfig = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}
