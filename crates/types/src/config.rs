use std::{env, fs, io, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory created under the system temp dir when no explicit sandbox
/// base is configured.
pub const DEFAULT_SANDBOX_DIR_NAME: &str = "moltbot-workers";

/// Pool-wide policy knobs. Every field has a serde default so a partial TOML
/// file (or an empty one) yields a working configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_sandbox_base_dir")]
    pub sandbox_base_dir: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: usize,
    #[serde(default = "default_restart_window_ms")]
    pub restart_window_ms: u64,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            sandbox_base_dir: default_sandbox_base_dir(),
            max_concurrent: default_max_concurrent(),
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_memory_bytes: default_max_memory_bytes(),
            max_requests: default_max_requests(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_window_ms: default_restart_window_ms(),
            virtual_nodes: default_virtual_nodes(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl PoolSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.worker_count == 0 {
            return Err(SettingsError::InvalidField {
                field: "worker_count",
            });
        }
        if self.virtual_nodes == 0 {
            return Err(SettingsError::InvalidField {
                field: "virtual_nodes",
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidField {
                field: "request_timeout_ms",
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidField {
                field: "heartbeat_interval_ms",
            });
        }
        if self.restart_window_ms == 0 {
            return Err(SettingsError::InvalidField {
                field: "restart_window_ms",
            });
        }
        if self.sandbox_base_dir.as_os_str().is_empty() {
            return Err(SettingsError::InvalidField {
                field: "sandbox_base_dir",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read pool settings `{path}`: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse pool settings `{path}`: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("pool settings field `{field}` must not be zero or empty")]
    InvalidField { field: &'static str },
}

pub fn load_pool_settings(path: impl Into<PathBuf>) -> Result<PoolSettings, SettingsError> {
    let path = path.into();
    let contents = fs::read_to_string(&path).map_err(|source| SettingsError::ReadConfig {
        path: path.clone(),
        source,
    })?;
    let settings: PoolSettings =
        toml::from_str(&contents).map_err(|source| SettingsError::ParseConfig {
            path: path.clone(),
            source,
        })?;
    settings.validate()?;
    Ok(settings)
}

fn default_worker_count() -> usize {
    4
}

fn default_sandbox_base_dir() -> PathBuf {
    env::temp_dir().join(DEFAULT_SANDBOX_DIR_NAME)
}

fn default_max_concurrent() -> usize {
    10
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_max_memory_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_max_requests() -> u64 {
    10_000
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

fn default_max_restart_attempts() -> usize {
    5
}

fn default_restart_window_ms() -> u64 {
    60_000
}

fn default_virtual_nodes() -> usize {
    150
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}
