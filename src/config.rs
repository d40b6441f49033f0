use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::DEFAULT_MAX_BATCH;
use crate::freshness::DEFAULT_THRESHOLD_MS;
use crate::identity::Scheme;
use crate::types::Region;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub store: StoreConfig,
  /// JSON file with `{fleet, operator, registration}` records
  pub fleet_reference: PathBuf,
  #[serde(default)]
  pub freshness: FreshnessConfig,
  #[serde(default)]
  pub providers: Vec<ProviderConfig>,
  pub push: Option<PushConfig>,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_bind")]
  pub bind: SocketAddr,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: default_bind(),
    }
  }
}

fn default_bind() -> SocketAddr {
  SocketAddr::from(([0, 0, 0, 0], 3000))
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  /// SQLite file; defaults to the platform data directory
  pub path: Option<PathBuf>,
  /// Upper bound on rows per upsert request
  #[serde(default = "default_max_batch")]
  pub max_batch: usize,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_batch: default_max_batch(),
    }
  }
}

fn default_max_batch() -> usize {
  DEFAULT_MAX_BATCH
}

#[derive(Debug, Clone, Deserialize)]
pub struct FreshnessConfig {
  #[serde(default = "default_threshold_ms")]
  pub threshold_ms: i64,
}

impl Default for FreshnessConfig {
  fn default() -> Self {
    Self {
      threshold_ms: default_threshold_ms(),
    }
  }
}

fn default_threshold_ms() -> i64 {
  DEFAULT_THRESHOLD_MS
}

/// Which GTFS-realtime vehicle descriptor field carries the identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdField {
  #[default]
  Label,
  Id,
  LicensePlate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
  pub name: String,
  pub region: Region,
  pub url: Url,
  #[serde(default)]
  pub scheme: Scheme,
  #[serde(default)]
  pub id_field: IdField,
  #[serde(default = "default_poll_interval_secs")]
  pub poll_interval_secs: u64,
  #[serde(default = "default_fetch_timeout_secs")]
  pub fetch_timeout_secs: u64,
  pub auth: AuthConfig,
}

fn default_poll_interval_secs() -> u64 {
  60
}

fn default_fetch_timeout_secs() -> u64 {
  10
}

impl ProviderConfig {
  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }

  /// Fetch deadline, kept strictly below the poll interval.
  pub fn fetch_timeout(&self) -> Duration {
    let interval = self.poll_interval();
    let timeout = Duration::from_secs(self.fetch_timeout_secs.max(1));
    if timeout >= interval {
      interval.mul_f64(0.9)
    } else {
      timeout
    }
  }
}

/// Credential headers for a provider. Only environment variable names live here.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
  /// Header carrying the key, e.g. "KeyId" or "Authorization"
  pub header: String,
  /// Environment variable holding the key
  pub env: String,
  /// Prepended to the key, e.g. "apikey "
  #[serde(default)]
  pub prefix: String,
  /// Second header for providers using a key id + secret pair
  pub secret_header: Option<String>,
  pub secret_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
  pub url: Url,
  pub region: Region,
  /// Environment variable holding the hub bearer token
  pub token_env: String,
  #[serde(default)]
  pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
  #[serde(default = "default_initial_ms")]
  pub initial_ms: u64,
  #[serde(default = "default_max_ms")]
  pub max_ms: u64,
  #[serde(default = "default_multiplier")]
  pub multiplier: f64,
  #[serde(default = "default_jitter_ms")]
  pub jitter_ms: u64,
}

impl ReconnectConfig {
  /// Reject settings that would let the reconnect delay shrink or vanish.
  pub fn validate(&self) -> Result<()> {
    if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
      return Err(eyre!(
        "push.reconnect.multiplier must be a finite number >= 1.0, got {}",
        self.multiplier
      ));
    }
    if self.initial_ms == 0 || self.initial_ms > self.max_ms {
      return Err(eyre!(
        "push.reconnect needs 0 < initial_ms <= max_ms, got {} and {}",
        self.initial_ms,
        self.max_ms
      ));
    }
    Ok(())
  }
}

impl Default for ReconnectConfig {
  fn default() -> Self {
    Self {
      initial_ms: default_initial_ms(),
      max_ms: default_max_ms(),
      multiplier: default_multiplier(),
      jitter_ms: default_jitter_ms(),
    }
  }
}

fn default_initial_ms() -> u64 {
  1_000
}

fn default_max_ms() -> u64 {
  30_000
}

fn default_multiplier() -> f64 {
  2.0
}

fn default_jitter_ms() -> u64 {
  250
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Directory for a daily-rolling log file; stderr only when unset
  pub directory: Option<PathBuf>,
  #[serde(default = "default_filter")]
  pub filter: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      directory: None,
      filter: default_filter(),
    }
  }
}

fn default_filter() -> String {
  "fleetwatch=info,tower_http=info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fleetwatch.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fleetwatch/config.yaml
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
        "No configuration file found. Create one at ~/.config/fleetwatch/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fleetwatch.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fleetwatch").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;

    let mut names = std::collections::BTreeSet::new();
    for provider in &config.providers {
      if !names.insert(provider.name.as_str()) {
        return Err(eyre!("duplicate provider name '{}'", provider.name));
      }
    }
    if config.freshness.threshold_ms <= 0 {
      return Err(eyre!("freshness.threshold_ms must be positive"));
    }
    if let Some(push) = &config.push {
      push.reconnect.validate()?;
    }

    Ok(config)
  }
}

/// Read a secret from the environment, treating blank values as absent.
pub fn get_secret(env: &str) -> Option<String> {
  std::env::var(env)
    .ok()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}
