use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Identity of a monitored container.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TargetKey {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl TargetKey {
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }

    pub fn belongs_to(&self, namespace: &str, pod: &str) -> bool {
        self.namespace == namespace && self.pod == pod
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)
    }
}

/// Per-container streaming configuration, fixed for the life of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub key: TargetKey,
    pub channel: String,
    /// Raw filter expression, matched case-insensitively. `.*` matches everything.
    pub filter: String,
    pub min_level: LogLevel,
    pub max_lines: usize,
    pub cooldown: Duration,
}

impl Target {
    pub fn new(key: TargetKey, channel: impl Into<String>) -> Self {
        Self {
            key,
            channel: channel.into(),
            filter: MATCH_ALL.to_string(),
            min_level: LogLevel::Info,
            max_lines: 10,
            cooldown: Duration::from_secs(60),
        }
    }
}

pub const MATCH_ALL: &str = ".*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

static LEVEL_PATTERNS: Lazy<Vec<(Regex, LogLevel)>> = Lazy::new(|| {
    [
        (r"\b(ERROR|FATAL|CRITICAL)\b", LogLevel::Error),
        (r"\b(WARN|WARNING)\b", LogLevel::Warn),
        (r"\b(INFO|INFORMATION)\b", LogLevel::Info),
        (r"\b(DEBUG|TRACE)\b", LogLevel::Debug),
    ]
    .into_iter()
    .filter_map(|(pattern, level)| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .ok()
            .map(|re| (re, level))
    })
    .collect()
});

impl LogLevel {
    /// Severity keyword detection in priority order; lines without a keyword are `Info`.
    pub fn detect(line: &str) -> Self {
        LEVEL_PATTERNS
            .iter()
            .find(|(re, _)| re.is_match(line))
            .map(|(_, level)| *level)
            .unwrap_or(LogLevel::Info)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Capitalized name used in message titles.
    pub fn title(&self) -> &'static str {
        match self {
            LogLevel::Debug => "Debug",
            LogLevel::Info => "Info",
            LogLevel::Warn => "Warning",
            LogLevel::Error => "Error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "invalid log level '{}', expected debug, info, warn or error",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub received_at: tokio::time::Instant,
    pub line: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    LogBatch,
    Consolidation,
    Resolution,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageField {
    pub name: String,
    pub value: String,
}

/// Sink-ready notification payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub kind: MessageKind,
    pub level: LogLevel,
    pub title: String,
    pub fields: Vec<MessageField>,
    pub body: String,
    pub footer: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    /// Plain-text rendering used as the notification fallback text.
    pub fn to_text(&self) -> String {
        let mut text = self.title.clone();
        for field in &self.fields {
            text.push_str(&format!("\n{}: {}", field.name, field.value));
        }
        if !self.body.is_empty() {
            text.push('\n');
            text.push_str(&self.body);
        }
        text
    }
}

pub fn field(name: &str, value: impl Into<String>) -> MessageField {
    MessageField {
        name: name.to_string(),
        value: value.into(),
    }
}
