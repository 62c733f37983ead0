use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub gateway: GatewayConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  /// Directory holding the database and log files (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  /// Default log filter when RUST_LOG is unset
  pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL of the hosted data API (e.g. "https://xyz.example.co/rest/v1")
  pub url: String,
  /// Path probed to decide whether the backend is reachable
  pub health_path: String,
  /// Hosts whose responses are never cached (domain suffix match)
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub network_only_hosts: Vec<String>,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:54321/rest/v1".to_string(),
      health_path: "/".to_string(),
      network_only_hosts: vec![
        "supabase.co".to_string(),
        "supabase.in".to_string(),
        "intasend.com".to_string(),
        "safaricom.co.ke".to_string(),
        "cdn.jsdelivr.net".to_string(),
        "cdnjs.cloudflare.com".to_string(),
      ],
    }
  }
}

impl BackendConfig {
  /// URL probed for reachability: `health_path` resolved against `url`.
  pub fn health_url(&self) -> Result<Url> {
    let base =
      Url::parse(&self.url).map_err(|e| eyre!("Invalid backend url {}: {}", self.url, e))?;
    base
      .join(&self.health_path)
      .map_err(|e| eyre!("Invalid health path {}: {}", self.health_path, e))
  }
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  /// Address the local gateway listens on
  pub listen: String,
  /// Origin serving the POS web app; origin-form request paths resolve against it
  pub app_origin: String,
  /// Activate a freshly installed cache version without waiting for SKIP_WAITING
  pub skip_waiting: bool,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      listen: "127.0.0.1:8787".to_string(),
      app_origin: "http://localhost:3000".to_string(),
      skip_waiting: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Bumped on every deploy; partitions under other versions are deleted on activation
  pub version: String,
  pub prefix: String,
  /// App-shell paths precached on install, relative to the app origin
  pub shell_files: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      version: "v1".to_string(),
      prefix: "pos".to_string(),
      shell_files: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  pub startup_delay_secs: u64,
  pub probe_interval_secs: u64,
  pub replay_timeout_secs: u64,
  pub max_attempts: u32,
  pub backoff_base_secs: u64,
  pub backoff_max_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      startup_delay_secs: 2,
      probe_interval_secs: 10,
      replay_timeout_secs: 30,
      max_attempts: 5,
      backoff_base_secs: 5,
      backoff_max_secs: 300,
    }
  }
}

impl SyncConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts.max(1),
      base_delay: Duration::from_secs(self.backoff_base_secs),
      max_delay: Duration::from_secs(self.backoff_max_secs),
    }
  }

  pub fn replay_timeout(&self) -> Duration {
    Duration::from_secs(self.replay_timeout_secs.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tillsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tillsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tillsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tillsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Resolve the data directory, creating nothing.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tillsync"))
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks TILLSYNC_API_KEY first, then BACKEND_API_KEY as fallback.
  pub fn get_api_key() -> Option<String> {
    std::env::var("TILLSYNC_API_KEY")
      .or_else(|_| std::env::var("BACKEND_API_KEY"))
      .ok()
  }
}
