//! Configuration loading for the sync scheduler daemon.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SYNCD_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `SYNCD_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Directory holding the persisted scheduler state files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Tuning knobs for the dispatcher worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Per-active-job watchdog, seconds.
    #[serde(default = "default_watchdog_secs")]
    pub watchdog_secs: u64,
    /// An active job older than this is eligible for long-running preemption.
    #[serde(default = "default_max_run_ms")]
    pub max_run_ms: i64,
    /// Concurrent initialization syncs.
    #[serde(default = "default_max_init_syncs")]
    pub max_init_syncs: usize,
    /// Concurrent regular syncs.
    #[serde(default = "default_max_regular_syncs")]
    pub max_regular_syncs: usize,
    /// Delay before a failed or collided job is re-queued, milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: i64,
    /// First-failure backoff delay, milliseconds. Doubled on each failure.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: i64,
    /// Floor applied to requested periodic sync intervals, seconds.
    #[serde(default = "default_min_period_sec")]
    pub min_period_sec: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            watchdog_secs: default_watchdog_secs(),
            max_run_ms: default_max_run_ms(),
            max_init_syncs: default_max_init_syncs(),
            max_regular_syncs: default_max_regular_syncs(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            min_period_sec: default_min_period_sec(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a JSON representation suitable for startup logging (the
    /// schema holds no secrets).
    pub fn as_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/sync-manager")
}

fn default_watchdog_secs() -> u64 {
    300
}

fn default_max_run_ms() -> i64 {
    5 * 60 * 1000
}

fn default_max_init_syncs() -> usize {
    2
}

fn default_max_regular_syncs() -> usize {
    10
}

fn default_retry_delay_ms() -> i64 {
    10_000
}

fn default_backoff_base_ms() -> i64 {
    10_000
}

fn default_min_period_sec() -> i64 {
    300
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

/// Loads configuration using layered `.env` files and `SYNCD_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration from the layered sources, the process
    /// environment winning over any file layer.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("SYNCD_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let data_dir = layered
            .remove("DATA_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let worker = WorkerConfig {
            watchdog_secs: parsed(&mut layered, "WATCHDOG_SECS", default_watchdog_secs),
            max_run_ms: parsed(&mut layered, "MAX_RUN_MS", default_max_run_ms),
            max_init_syncs: parsed(&mut layered, "MAX_INIT_SYNCS", default_max_init_syncs),
            max_regular_syncs: parsed(
                &mut layered,
                "MAX_REGULAR_SYNCS",
                default_max_regular_syncs,
            ),
            retry_delay_ms: parsed(&mut layered, "RETRY_DELAY_MS", default_retry_delay_ms),
            backoff_base_ms: parsed(&mut layered, "BACKOFF_BASE_MS", default_backoff_base_ms),
            min_period_sec: parsed(&mut layered, "MIN_PERIOD_SEC", default_min_period_sec),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            data_dir,
            worker,
        };

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("SYNCD_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("SYNCD_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::EnvFile { path, source }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
    default: fn() -> T,
) -> T {
    layered
        .remove(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(default)
}
