//! Shared configuration logic for the fleet host, simulator, and tests.
//!
//! ## Example
//!
//! ```toml
//! [scheduler]
//! max_concurrent = 2
//! stale_threshold_secs = 600
//!
//! [dispatcher]
//! command_timeout_ms = 5000
//! max_retries = 3
//!
//! [check]
//! every_commands = 50
//! every_secs = 30
//! ```
//!
//! Every section and field is optional; missing values take the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::clock::saturating_seconds;
use crate::protocol::CheckCriteria;

/// Upper bound for every duration setting: one year.
pub const MAX_SPAN_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub check: CheckConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub slicer: SlicerConfig,
    #[serde(default)]
    pub gcode: GcodeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Slicing queue admission and staleness recovery.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_stale_retries")]
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_threshold_secs: default_stale_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_retries: default_stale_retries(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        saturating_seconds(self.stale_threshold_secs)
    }
}

/// Command delivery, retry and liveness.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_command_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub backoff_jitter_ms: u64,
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_command_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: 0,
            liveness_window_secs: default_liveness_window_secs(),
            liveness_poll_ms: default_liveness_poll_ms(),
        }
    }
}

impl DispatcherConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn liveness_window(&self) -> chrono::Duration {
        saturating_seconds(self.liveness_window_secs)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

/// Default check cadence. A trigger set to 0 is disabled.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckConfig {
    #[serde(default = "default_check_every_commands")]
    pub every_commands: Option<u32>,
    #[serde(default = "default_check_every_secs")]
    pub every_secs: Option<u64>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            every_commands: default_check_every_commands(),
            every_secs: default_check_every_secs(),
        }
    }
}

impl CheckConfig {
    pub fn criteria(&self) -> CheckCriteria {
        CheckCriteria {
            every_commands: self.every_commands.filter(|n| *n > 0),
            every_secs: self.every_secs.filter(|n| *n > 0),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub auto_resume_on_reconnect: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConverterConfig {
    #[serde(default = "default_converter_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_converter_timeout_secs(),
        }
    }
}

/// Archival cleanup of finished queue entries and print jobs. Off while
/// `max_age_secs` is unset.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub max_age_secs: Option<u64>,
    #[serde(default = "default_retention_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: None,
            sweep_interval_secs: default_retention_sweep_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn max_age(&self) -> Option<chrono::Duration> {
        self.max_age_secs.map(saturating_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// External slicer invocation. `args` may contain `{model}`, `{profile}`
/// and `{output}` placeholders.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlicerConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_slicer_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for SlicerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            output_dir: default_slicer_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcodeConfig {
    #[serde(default = "default_gcode_root")]
    pub root: PathBuf,
}

impl Default for GcodeConfig {
    fn default() -> Self {
        Self {
            root: default_gcode_root(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent == 0 {
            return Err(ConfigError::Invalid("scheduler.max_concurrent must be > 0".to_string()));
        }
        if self.scheduler.poll_interval_ms == 0
            || self.scheduler.sweep_interval_secs == 0
            || self.dispatcher.liveness_poll_ms == 0
        {
            return Err(ConfigError::Invalid("loop intervals must be > 0".to_string()));
        }
        let required = [
            ("scheduler.stale_threshold_secs", self.scheduler.stale_threshold_secs),
            ("dispatcher.command_timeout_ms", self.dispatcher.command_timeout_ms),
            ("dispatcher.liveness_window_secs", self.dispatcher.liveness_window_secs),
            ("retention.sweep_interval_secs", self.retention.sweep_interval_secs),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        if self.dispatcher.backoff_base_ms > self.dispatcher.backoff_max_ms {
            return Err(ConfigError::Invalid(
                "dispatcher.backoff_base_ms must not exceed backoff_max_ms".to_string(),
            ));
        }

        let seconds = [
            ("scheduler.stale_threshold_secs", self.scheduler.stale_threshold_secs),
            ("scheduler.sweep_interval_secs", self.scheduler.sweep_interval_secs),
            ("dispatcher.liveness_window_secs", self.dispatcher.liveness_window_secs),
            ("check.every_secs", self.check.every_secs.unwrap_or(0)),
            ("converter.timeout_secs", self.converter.timeout_secs),
            ("retention.max_age_secs", self.retention.max_age_secs.unwrap_or(0)),
            ("retention.sweep_interval_secs", self.retention.sweep_interval_secs),
        ];
        for (name, secs) in seconds {
            if secs > MAX_SPAN_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {MAX_SPAN_SECS}"
                )));
            }
        }
        let millis = [
            ("scheduler.poll_interval_ms", self.scheduler.poll_interval_ms),
            ("dispatcher.command_timeout_ms", self.dispatcher.command_timeout_ms),
            ("dispatcher.backoff_max_ms", self.dispatcher.backoff_max_ms),
            ("dispatcher.backoff_jitter_ms", self.dispatcher.backoff_jitter_ms),
            ("dispatcher.liveness_poll_ms", self.dispatcher.liveness_poll_ms),
        ];
        for (name, ms) in millis {
            if ms > MAX_SPAN_SECS * 1000 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {}",
                    MAX_SPAN_SECS * 1000
                )));
            }
        }
        Ok(())
    }
}

fn default_max_concurrent() -> usize { 2 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_stale_threshold_secs() -> u64 { 900 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_stale_retries() -> u32 { 2 }
fn default_command_timeout_ms() -> u64 { 5000 }
fn default_command_retries() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 250 }
fn default_backoff_max_ms() -> u64 { 8000 }
fn default_liveness_window_secs() -> u64 { 15 }
fn default_liveness_poll_ms() -> u64 { 1000 }
fn default_check_every_commands() -> Option<u32> { Some(100) }
fn default_check_every_secs() -> Option<u64> { Some(30) }
fn default_converter_timeout_secs() -> u64 { 30 }
fn default_slicer_output_dir() -> PathBuf { PathBuf::from("sliced") }
fn default_gcode_root() -> PathBuf { PathBuf::from("gcode") }
fn default_bind() -> String { "0.0.0.0:3000".to_string() }
fn default_retention_sweep_secs() -> u64 { 3600 }

pub fn load_config(path: impl AsRef<Path>) -> Result<FleetConfig, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path.display(), e);
        ConfigError::Io(e)
    })?;
    let config: FleetConfig = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
