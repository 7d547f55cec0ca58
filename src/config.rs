use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DataError, Result};

pub const URL_ENV: &str = "STOREFRONT_URL";
pub const ANON_KEY_ENV: &str = "STOREFRONT_ANON_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Service endpoint, e.g. `https://project.example.co`
  #[serde(default)]
  pub url: String,
  /// Anonymous API key sent with every request
  #[serde(default)]
  pub anon_key: String,
  /// Value of the `x-client-info` header
  #[serde(default = "default_client_info")]
  pub client_info: String,
  /// Cheap resource read by the health probe
  #[serde(default = "default_probe_resource")]
  pub probe_resource: String,
  #[serde(default = "default_health_check_interval")]
  pub health_check_interval_secs: u64,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub batch: BatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub stale_time_secs: u64,
  pub cache_time_secs: u64,
  pub sweep_interval_secs: u64,
  /// Total attempts per fetch, including the first
  pub retry_count: u32,
  pub retry_delay_ms: u64,
  pub read_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 5 * 60,
      cache_time_secs: 10 * 60,
      sweep_interval_secs: 60,
      retry_count: 3,
      retry_delay_ms: 1000,
      read_timeout_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
  /// Queue length that forces an immediate flush
  pub size: usize,
  /// Maximum wait after the first enqueue before flushing
  pub delay_ms: u64,
  /// Default rows per chunk for bulk writes
  pub chunk_size: usize,
  /// Attempts used by `execute_query` when the caller does not choose
  pub query_retries: u32,
}

impl Default for BatchConfig {
  fn default() -> Self {
    Self {
      size: 10,
      delay_ms: 100,
      chunk_size: 100,
      query_retries: 3,
    }
  }
}

fn default_client_info() -> String {
  format!("storefront-data/{}", env!("CARGO_PKG_VERSION"))
}

fn default_probe_resource() -> String {
  "products".to_string()
}

fn default_health_check_interval() -> u64 {
  30
}

impl Config {
  /// Configuration with the given endpoint and key and defaults elsewhere.
  pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      anon_key: anon_key.into(),
      client_info: default_client_info(),
      probe_resource: default_probe_resource(),
      health_check_interval_secs: default_health_check_interval(),
      cache: CacheConfig::default(),
      batch: BatchConfig::default(),
    }
  }

  /// Load configuration from file and environment.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./storefront.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/storefront/config.yaml
  ///
  /// `STOREFRONT_URL` and `STOREFRONT_ANON_KEY` override the file. The file
  /// may be absent when both are set. A missing endpoint or key is fatal.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(DataError::config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::new("", ""),
    };

    config.with_env_overrides().validated()
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("storefront.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("storefront").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      DataError::config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    serde_yaml::from_str(&contents).map_err(|e| {
      DataError::config(format!(
        "Failed to parse config file {}: {}",
        path.display(),
        e
      ))
    })
  }

  fn with_env_overrides(mut self) -> Self {
    if let Ok(url) = std::env::var(URL_ENV) {
      self.url = url;
    }
    if let Ok(key) = std::env::var(ANON_KEY_ENV) {
      self.anon_key = key;
    }
    self
  }

  /// Reject configurations that cannot reach the service.
  pub fn validated(self) -> Result<Self> {
    if self.url.trim().is_empty() {
      return Err(DataError::config(format!(
        "Service URL is missing. Set `url` in the config file or {}.",
        URL_ENV
      )));
    }
    if self.anon_key.trim().is_empty() {
      return Err(DataError::config(format!(
        "Anonymous API key is missing. Set `anon_key` in the config file or {}.",
        ANON_KEY_ENV
      )));
    }
    let parsed = url::Url::parse(&self.url)
      .map_err(|e| DataError::config(format!("Invalid service URL {}: {}", self.url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
      return Err(DataError::config(format!(
        "Service URL must be http(s), got {}",
        parsed.scheme()
      )));
    }
    if self.batch.size == 0 || self.batch.chunk_size == 0 {
      return Err(DataError::config("batch size and chunk size must be positive"));
    }
    Ok(self)
  }

  pub fn health_check_interval(&self) -> Duration {
    Duration::from_secs(self.health_check_interval_secs)
  }
}
