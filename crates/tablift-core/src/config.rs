//! Tablift configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TabliftError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabliftConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for TabliftConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// External ETL engine invocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine installation directory.
    #[serde(default = "default_engine_home")]
    pub home: String,
    /// Launcher script, relative to `home`.
    #[serde(default = "default_launcher")]
    pub launcher: String,
    /// Default per-execution timeout, seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of trailer lines the engine prints at the end of a run.
    #[serde(default = "default_trailer_lines")]
    pub trailer_lines: usize,
}

fn default_engine_home() -> String {
    "/opt/etl-engine".into()
}
fn default_launcher() -> String {
    "bin/engine.sh".into()
}
fn default_timeout_secs() -> u64 {
    7200
}
fn default_trailer_lines() -> usize {
    7
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home: default_engine_home(),
            launcher: default_launcher(),
            timeout_secs: default_timeout_secs(),
            trailer_lines: default_trailer_lines(),
        }
    }
}

/// Poller and worker-pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Task poll period, seconds.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    /// Initialization-scan period, seconds (new tasks needing bookkeeping).
    #[serde(default = "default_init_scan_secs")]
    pub init_scan_secs: u64,
    /// Worker count. 0 = one per available processing unit.
    #[serde(default)]
    pub workers: usize,
    /// Worker sleep when the queue is empty, milliseconds.
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// A Waiting execution older than this without a queue entry is
    /// re-enqueued by the reconciliation sweep, seconds.
    #[serde(default = "default_reconcile_after_secs")]
    pub reconcile_after_secs: i64,
    /// Shutdown grace period for in-flight workers, seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_poll_secs() -> u64 {
    5
}
fn default_init_scan_secs() -> u64 {
    30
}
fn default_idle_sleep_ms() -> u64 {
    500
}
fn default_reconcile_after_secs() -> i64 {
    60
}
fn default_shutdown_grace_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
            init_scan_secs: default_init_scan_secs(),
            workers: 0,
            idle_sleep_ms: default_idle_sleep_ms(),
            reconcile_after_secs: default_reconcile_after_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl TabliftConfig {
    /// Load config from the default path (~/.tablift/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TabliftError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TabliftError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TabliftError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the tablift home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tablift")
    }

    /// Default database path (~/.tablift/tablift.db).
    pub fn default_db_path() -> PathBuf {
        Self::home_dir().join("tablift.db")
    }
}
