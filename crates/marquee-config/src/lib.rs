// SPDX-License-Identifier: GPL-3.0-or-later
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://marquee.db".to_string(),
            pool_max_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Emit newline-delimited JSON instead of the human readable format
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// Sizing of the three worker pools and their queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub high: usize,
    pub normal: usize,
    pub background: usize,
    /// Maximum number of queued tasks per pool
    pub queue_capacity: usize,
    /// How long an enqueue may wait for a free queue slot before it is rejected
    pub enqueue_timeout_ms: u64,
    /// Grace period given to in-flight tasks when the engine shuts down
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            high: 2,
            normal: 3,
            background: 1,
            queue_capacity: 256,
            enqueue_timeout_ms: 2_000,
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    /// Timezone cron expressions are evaluated in: "UTC", "local", an IANA name such as "Europe/Berlin" or a fixed offset such as "+02:00"
    pub timezone: String,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Execution limit applied to commands without a more specific one
    pub default_timeout_secs: Option<u64>,
    /// Per-command execution limits, keyed by command name
    pub command_timeouts: HashMap<String, u64>,
    /// Finished tasks older than this are removed by housekeeping
    pub retention_days: u32,
}

impl TaskConfig {
    /// Execution limit configured specifically for `command_name`.
    pub fn command_timeout(&self, command_name: &str) -> Option<Duration> {
        self.command_timeouts
            .get(command_name)
            .copied()
            .map(Duration::from_secs)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: None,
            command_timeouts: HashMap::new(),
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub telemetry: TelemetryConfig,
    pub workers: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub tasks: TaskConfig,
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: MARQUEE_).
pub fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("MARQUEE_").split("__"));

    let config: AppConfig = figment.extract()?;
    info!(target: "config", "configuration loaded");
    Ok(config)
}
