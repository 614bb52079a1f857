use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "kube-log-notifier")]
#[command(about = "Forward filtered, deduplicated container logs from annotated pods to Slack")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'f', long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Namespace to watch (repeatable or comma-separated). Defaults to all namespaces.
    #[arg(short = 'n', long, env = "K8S_NAMESPACES", value_delimiter = ',')]
    pub namespace: Vec<String>,

    /// Kubeconfig context
    #[arg(long)]
    pub context: Option<String>,

    /// Slack bot token
    #[arg(long, env = "SLACK_TOKEN", hide_env_values = true)]
    pub slack_token: Option<String>,

    /// Print notifications to stdout instead of sending them to Slack
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Diagnostic log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}
