//! Settings loaded from a TOML file
//!
//! Every field has a default so the binary runs without a config file;
//! the file overrides only what it names.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::notifications::NotificationChannelConfig;

/// Top-level settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub analytics: AnalyticsSettings,

    #[serde(default)]
    pub alerting: AlertingSettings,

    #[serde(default)]
    pub containers: ContainerSettings,

    /// Path to the SQLite store; defaults to the platform data directory
    pub store_path: Option<String>,

    /// Named notification channels referenced by alert configs
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannelConfig>,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    /// The live configuration file the proxy serves from
    #[serde(default = "default_active_config_path")]
    pub active_config_path: String,

    /// Directory for candidate configs awaiting validation
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// Config test command; `{config}` is replaced with the staging path
    #[serde(default = "default_test_command")]
    pub test_command: String,

    /// Command signalling the running proxy to reload
    #[serde(default = "default_reload_command")]
    pub reload_command: String,

    /// Upper bound on test/reload command runtime
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Window for coalescing rapid rule edits into one apply
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl ProxySettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            active_config_path: default_active_config_path(),
            staging_dir: default_staging_dir(),
            test_command: default_test_command(),
            reload_command: default_reload_command(),
            command_timeout_secs: default_command_timeout_secs(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_active_config_path() -> String {
    "/etc/rulegate/nginx.conf".to_string()
}

fn default_staging_dir() -> String {
    "/var/lib/rulegate/staging".to_string()
}

fn default_test_command() -> String {
    "nginx -t -c {config}".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_debounce_ms() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsSettings {
    /// Traffic points retained per rule
    #[serde(default = "default_max_points")]
    pub max_points: usize,

    /// Errors retained per rule
    #[serde(default = "default_max_errors")]
    pub max_errors: usize,

    /// How often per-rule summaries are published on the bus
    #[serde(default = "default_emit_interval_secs")]
    pub emit_interval_secs: u64,
}

impl AnalyticsSettings {
    pub fn emit_interval(&self) -> Duration {
        Duration::from_secs(self.emit_interval_secs)
    }
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            max_points: default_max_points(),
            max_errors: default_max_errors(),
            emit_interval_secs: default_emit_interval_secs(),
        }
    }
}

fn default_max_points() -> usize {
    10_000
}

fn default_max_errors() -> usize {
    2_000
}

fn default_emit_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlertingSettings {
    /// Evaluation tick for alert configs
    #[serde(default = "default_alert_tick_secs")]
    pub tick_secs: u64,
}

impl AlertingSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            tick_secs: default_alert_tick_secs(),
        }
    }
}

fn default_alert_tick_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainerSettings {
    /// Watch containers and publish stats (default: on)
    #[serde(default = "default_containers_enabled")]
    pub enabled: bool,

    /// Docker daemon address; autodetected when unset
    pub docker_host: Option<String>,

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

impl ContainerSettings {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            enabled: default_containers_enabled(),
            docker_host: None,
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

fn default_containers_enabled() -> bool {
    true
}

fn default_stats_interval_secs() -> u64 {
    15
}
