use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::Cli;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub slack: SlackConfig,
    pub kubernetes: KubernetesConfig,
    pub stream: StreamConfig,
    pub consolidation: ConsolidationConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub token: Option<String>,
    pub api_url: String,
    pub default_channel: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: "https://slack.com/api".to_string(),
            default_channel: "#general".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Namespaces to watch; empty means all namespaces.
    pub namespaces: Vec<String>,
    pub annotation_prefix: String,
    pub poll_interval_secs: u64,
    pub default_max_lines: usize,
    pub default_cooldown_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            annotation_prefix: "slaking".to_string(),
            poll_interval_secs: 5,
            default_max_lines: 10,
            default_cooldown_secs: 60,
        }
    }
}

impl KubernetesConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Age of the oldest buffered line after which the buffer is flushed even if not full.
    pub stale_after_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub min_repeat_count: u64,
    pub consolidation_delay_secs: u64,
    pub inactivity_timeout_secs: u64,
    /// Wait between detecting inactivity and announcing resolution. Zero resolves immediately.
    pub resolution_delay_secs: u64,
    pub enable_stopped_messages: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            min_repeat_count: 10,
            consolidation_delay_secs: 120,
            inactivity_timeout_secs: 900,
            resolution_delay_secs: 900,
            enable_stopped_messages: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    Drain,
    Abandon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub send_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub honor_backoff: bool,
    pub queue_capacity: usize,
    pub shutdown: ShutdownPolicy,
    pub drain_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 5000,
            honor_backoff: true,
            queue_capacity: 1000,
            shutdown: ShutdownPolicy::Drain,
            drain_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Loads the YAML file if present, falling back to defaults when it does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            info!("No configuration file given, using defaults");
            return Ok(Self::default());
        };

        if !path.exists() {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path.display(), e))?;
        let config = Self::from_yaml(&raw)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path.display(), e))?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Command line flags and their environment variables win over the file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(token) = &cli.slack_token {
            self.slack.token = Some(token.clone());
        }
        if !cli.namespace.is_empty() {
            self.kubernetes.namespaces = cli
                .namespace
                .iter()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect();
        }
    }

    pub fn validate(&self, require_token: bool) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if require_token && self.slack.token.as_deref().is_none_or(str::is_empty) {
            errors.push("Slack token is required (set SLACK_TOKEN or slack.token)".to_string());
        }
        if !self.slack.default_channel.starts_with('#') {
            errors.push("slack.default_channel must start with #".to_string());
        }
        if self.kubernetes.poll_interval_secs < 1 {
            errors.push("kubernetes.poll_interval_secs must be at least 1".to_string());
        }
        if self.kubernetes.default_max_lines < 1 {
            errors.push("kubernetes.default_max_lines must be at least 1".to_string());
        }
        if self.consolidation.min_repeat_count < 1 {
            errors.push("consolidation.min_repeat_count must be at least 1".to_string());
        }
        if self.delivery.queue_capacity < 1 {
            errors.push("delivery.queue_capacity must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration validation failed: {}", errors.join(", "));
        }
        Ok(())
    }
}
