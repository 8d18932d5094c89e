//! Tool configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::task::{PollPolicy, RetryPolicy, TaskSettings};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::Plain,
        }
    }
}

/// Settings of a topology operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Deadline for opening a directory connection.
    pub connect_timeout_ms: u64,
    /// Wait between two reads of a task entry.
    pub poll_interval_ms: u64,
    /// Initialization attempts on peer-not-found, the first included.
    pub max_attempts: u32,
    /// Backoff unit between initialization attempts.
    pub backoff_step_ms: u64,
    /// Clock skew tolerated between two nodes.
    pub skew_threshold_secs: u64,
    /// Prefix of generated task ids.
    pub task_id_prefix: String,
    /// Replicate the schema unless a request says otherwise.
    pub replicate_schema: bool,
    /// Go on when some servers of the topology cannot be read.
    pub accept_discovery_errors: bool,
    /// Logging.
    pub logging: LoggingConfig,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            poll_interval_ms: 500,
            max_attempts: 5,
            backoff_step_ms: 3000,
            skew_threshold_secs: 300,
            task_id_prefix: String::from("dsrepl"),
            replicate_schema: true,
            accept_discovery_errors: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl ToolConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ToolConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        if config.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(config)
    }

    /// Deadline for opening a connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Clock skew above which a warning is raised.
    pub fn skew_threshold(&self) -> Duration {
        Duration::from_secs(self.skew_threshold_secs)
    }

    /// Polling and retry settings for tasks.
    pub fn task_settings(&self) -> TaskSettings {
        TaskSettings {
            poll: PollPolicy {
                interval: Duration::from_millis(self.poll_interval_ms),
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                backoff_step: Duration::from_millis(self.backoff_step_ms),
            },
            id_prefix: self.task_id_prefix.clone(),
        }
    }
}
