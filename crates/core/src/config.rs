use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_POOL_SIZE: usize = 2;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
  #[error("parse error: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("invalid config: {0}")]
  Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CronJobConfig {
  pub schedule: String,
  pub wasm_file: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MqttSubConfig {
  pub topic: String,
  pub wasm_file: String,
}

/// Metadata for exposing the function as an agent tool.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolConfig {
  pub name: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub input_schema: serde_json::Value,
}

/// The full config surface of a Gojinn node. Loaded from a JSON document in
/// the data directory; unknown keys are rejected so typos fail provisioning
/// instead of being silently ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
  /// Module file to load. Required.
  pub path: String,
  /// Argv passed to the guest.
  pub args: Vec<String>,
  /// Environment variables passed to the guest.
  pub env: HashMap<String, String>,
  /// Per-call deadline in seconds. 0 applies the 60s default.
  pub timeout: u64,
  /// Human-readable linear-memory cap, e.g. "10MB".
  pub memory_limit: String,
  /// Computation budget per call. 0 disables fuel metering.
  pub fuel_limit: u64,
  /// Workers per function. 0 applies the default of 2.
  pub pool_size: usize,
  /// Host-dir -> guest-dir filesystem grants.
  pub mounts: HashMap<String, String>,
  /// Gate for the replay/reload debug endpoints.
  pub debug_secret: String,

  pub db_driver: String,
  pub db_dsn: String,

  pub server_name: String,
  pub nats_port: u16,
  pub cluster_name: String,
  pub cluster_port: u16,
  pub cluster_peers: Vec<String>,
  pub leaf_port: u16,
  pub leaf_remotes: Vec<String>,
  pub cluster_replicas: usize,
  pub store_cipher_key: String,
  pub trusted_nats_users: Vec<String>,
  pub nats_user_seed: String,

  pub cron_jobs: Vec<CronJobConfig>,

  pub mqtt_broker: String,
  pub mqtt_client_id: String,
  pub mqtt_username: String,
  pub mqtt_password: String,
  pub mqtt_subs: Vec<MqttSubConfig>,

  pub ai_provider: String,
  pub ai_model: String,
  pub ai_endpoint: String,
  pub ai_token: String,

  /// Hex-encoded Ed25519 public keys authorized to sign modules. Empty set
  /// disables verification (dev mode).
  pub trusted_signing_keys: Vec<String>,

  pub tool: Option<ToolConfig>,
}

impl Config {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let bytes = std::fs::read(path)?;
    let config: Config = serde_json::from_slice(&bytes)?;
    config.validate()?;
    return Ok(config);
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.path.is_empty() {
      return Err(ConfigError::Invalid("wasm file path is required".to_string()));
    }
    for job in &self.cron_jobs {
      if let Err(err) = cron::Schedule::from_str(&job.schedule) {
        return Err(ConfigError::Invalid(format!(
          "cron schedule '{}': {err}",
          job.schedule
        )));
      }
    }
    return Ok(());
  }

  pub fn pool_size(&self) -> usize {
    return if self.pool_size == 0 {
      DEFAULT_POOL_SIZE
    } else {
      self.pool_size
    };
  }

  pub fn timeout(&self) -> Duration {
    return if self.timeout == 0 {
      DEFAULT_TIMEOUT
    } else {
      Duration::from_secs(self.timeout)
    };
  }

  /// Linear-memory cap in 64KiB wasm pages, rounded up. An unparsable limit
  /// is dropped with a warning rather than failing provisioning.
  pub fn memory_pages(&self) -> Option<u64> {
    if self.memory_limit.is_empty() {
      return None;
    }
    return match bytesize::ByteSize::from_str(&self.memory_limit) {
      Ok(size) => Some(size.as_u64().div_ceil(65536)),
      Err(err) => {
        warn!("Ignoring unparsable memory_limit '{}': {err}", self.memory_limit);
        None
      }
    };
  }

  pub fn fuel_limit(&self) -> Option<u64> {
    return if self.fuel_limit == 0 {
      None
    } else {
      Some(self.fuel_limit)
    };
  }

  pub fn mounts(&self) -> Vec<(PathBuf, String)> {
    return self
      .mounts
      .iter()
      .map(|(host, guest)| (PathBuf::from(host), guest.clone()))
      .collect();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_applied() {
    let config = Config {
      path: "echo.wasm".to_string(),
      ..Default::default()
    };

    assert_eq!(config.pool_size(), 2);
    assert_eq!(config.timeout(), Duration::from_secs(60));
    assert_eq!(config.memory_pages(), None);
    assert_eq!(config.fuel_limit(), None);
  }

  #[test]
  fn test_memory_limit_pages_round_up() {
    let config = Config {
      path: "echo.wasm".to_string(),
      memory_limit: "10MB".to_string(),
      ..Default::default()
    };

    // 10MB = 10_000_000 bytes -> 153 pages (ceil).
    assert_eq!(config.memory_pages(), Some(10_000_000u64.div_ceil(65536)));
  }

  #[test]
  fn test_garbage_memory_limit_is_dropped() {
    let config = Config {
      path: "echo.wasm".to_string(),
      memory_limit: "BATATA".to_string(),
      ..Default::default()
    };
    assert_eq!(config.memory_pages(), None);
  }

  #[test]
  fn test_missing_path_rejected() {
    let config = Config::default();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_bad_cron_schedule_rejected() {
    let config = Config {
      path: "echo.wasm".to_string(),
      cron_jobs: vec![CronJobConfig {
        schedule: "not a schedule".to_string(),
        wasm_file: "cron.wasm".to_string(),
      }],
      ..Default::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_unknown_keys_rejected() {
    let parsed: Result<Config, _> =
      serde_json::from_str(r#"{"path": "x.wasm", "pool_sise": 3}"#);
    assert!(parsed.is_err());
  }
}
