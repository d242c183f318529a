//! Tasker Config
//!
//! Serializable configuration for the tasker engine. Every section has
//! defaults, so an empty JSON object (or no file at all) is a valid config.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `--config=tasker.json`)
//! - Code, by building the structs directly (tests do this)

mod http;
mod processor;

pub use http::{HttpConfig, RetryConfig};
pub use processor::ProcessorConfig;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime used for task functions that don't name one in their metadata.
pub const DEFAULT_RUNTIME: &str = "lua";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub store: StoreConfig,
  pub executor: ExecutorConfig,
  pub processor: ProcessorConfig,
  pub http: HttpConfig,
  pub lua: LuaConfig,
  /// Runtime name for task functions without a `runtime` metadata entry.
  pub default_runtime: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      store: StoreConfig::default(),
      executor: ExecutorConfig::default(),
      processor: ProcessorConfig::default(),
      http: HttpConfig::default(),
      lua: LuaConfig::default(),
      default_runtime: DEFAULT_RUNTIME.to_string(),
    }
  }
}

impl Config {
  /// Parse a config from JSON. Missing sections and fields take defaults.
  pub fn from_json(json: &str) -> serde_json::Result<Self> {
    serde_json::from_str(json)
  }
}

/// Record store settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// SQLite database file. Defaults to `<data_dir>/tasker.db`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub database_path: Option<PathBuf>,
}

/// Task executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
  /// How long a claimed task run stays locked before another executor may
  /// take it over.
  pub lease_ms: u64,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self { lease_ms: 300_000 }
  }
}

/// Lua runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LuaConfig {
  /// Memory cap for one task attempt's Lua state. Unlimited when absent.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub memory_limit_bytes: Option<usize>,
}
