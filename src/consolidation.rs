//! Repeated-pattern suppression.
//!
//! Every forwarded candidate line is normalized into a pattern and counted per
//! target. Once a pattern reaches the repeat threshold it is suppressed: a
//! single summary is sent after `consolidation_delay`, and a resolution notice
//! follows once the pattern has been quiet for long enough.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::ConsolidationConfig;
use crate::delivery::DeliveryQueue;
use crate::metrics::Metrics;
use crate::types::{LogLevel, Message, MessageKind, Target, TargetKey, field};

static NORMALIZERS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
            "<TIMESTAMP>",
        ),
        (r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b", "<IP>"),
        (
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<UUID>",
        ),
        (r"\b\d{10,}\b", "<ID>"),
        (r"\b[A-Za-z0-9+/]{20,}={0,2}", "<HASH>"),
        (r"\b\d{4,}\b", "<NUMBER>"),
        (r#""[^"]*""#, "<STRING>"),
        (r"'[^']*'", "<STRING>"),
    ]
    .into_iter()
    .filter_map(|(pattern, placeholder)| Regex::new(pattern).ok().map(|re| (re, placeholder)))
    .collect()
});

/// Replaces volatile tokens (timestamps, addresses, ids, hashes, numbers, quoted text)
/// with placeholders so repeats of the same event share one key.
pub fn normalize(line: &str) -> String {
    let mut pattern = line.to_string();
    for (re, placeholder) in NORMALIZERS.iter() {
        pattern = re.replace_all(&pattern, *placeholder).into_owned();
    }
    pattern.trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternState {
    Active,
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct ConsolidationSettings {
    pub threshold: u64,
    pub consolidation_delay: Duration,
    pub inactivity_timeout: Duration,
    pub resolution_delay: Duration,
    pub stopped_messages: bool,
}

impl From<&ConsolidationConfig> for ConsolidationSettings {
    fn from(cfg: &ConsolidationConfig) -> Self {
        Self {
            threshold: cfg.min_repeat_count.max(1),
            consolidation_delay: Duration::from_secs(cfg.consolidation_delay_secs),
            inactivity_timeout: Duration::from_secs(cfg.inactivity_timeout_secs),
            resolution_delay: Duration::from_secs(cfg.resolution_delay_secs),
            stopped_messages: cfg.enable_stopped_messages,
        }
    }
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self::from(&ConsolidationConfig::default())
    }
}

#[derive(Debug)]
struct Timer {
    id: u64,
    handle: AbortHandle,
}

impl Timer {
    fn cancel(self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
struct Pattern {
    target: Arc<Target>,
    level: LogLevel,
    state: PatternState,
    count: u64,
    /// Occurrences absorbed while suppressed since the last summary.
    repeats: u64,
    first_seen: Instant,
    last_seen: Instant,
    consolidation: Option<Timer>,
    resolution: Option<Timer>,
}

impl Pattern {
    fn new(target: Arc<Target>, text: &str, now: Instant) -> Self {
        Self {
            target,
            level: LogLevel::detect(text),
            state: PatternState::Active,
            count: 0,
            repeats: 0,
            first_seen: now,
            last_seen: now,
            consolidation: None,
            resolution: None,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.consolidation.take() {
            timer.cancel();
        }
        if let Some(timer) = self.resolution.take() {
            timer.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatternStats {
    pub total: usize,
    pub active: usize,
    pub suppressed: usize,
}

/// Snapshot of one tracked pattern, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSnapshot {
    pub pattern: String,
    pub state: PatternState,
    pub count: u64,
    pub consolidation_pending: bool,
    pub resolution_pending: bool,
}

type PatternTable = HashMap<TargetKey, HashMap<String, Pattern>>;

struct EngineInner {
    patterns: Mutex<PatternTable>,
    settings: ConsolidationSettings,
    queue: DeliveryQueue,
    metrics: Arc<Metrics>,
    next_timer_id: AtomicU64,
}

/// Owns every pattern record; callers only see forward/suppress decisions.
#[derive(Clone)]
pub struct ConsolidationEngine {
    inner: Arc<EngineInner>,
}

impl ConsolidationEngine {
    pub fn new(settings: ConsolidationSettings, queue: DeliveryQueue, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                patterns: Mutex::new(HashMap::new()),
                settings,
                queue,
                metrics,
                next_timer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Records one occurrence of `line` for `target` and decides whether it is forwarded.
    pub fn record(&self, target: &Arc<Target>, line: &str) -> Decision {
        let text = normalize(line);
        let now = Instant::now();
        let threshold = self.inner.settings.threshold;

        let mut table = self.inner.patterns.lock();
        let pattern = table
            .entry(target.key.clone())
            .or_default()
            .entry(text.clone())
            .or_insert_with(|| Pattern::new(target.clone(), &text, now));

        pattern.last_seen = now;
        // Any occurrence restarts the quiet window.
        if let Some(timer) = pattern.resolution.take() {
            debug!(stream = %target.key, "Pattern recurred, cancelling resolution: {}", text);
            timer.cancel();
        }

        match pattern.state {
            PatternState::Suppressed => {
                pattern.repeats += 1;
                Decision::Suppress
            }
            PatternState::Active => {
                pattern.count += 1;
                if pattern.count < threshold {
                    return Decision::Forward;
                }
                pattern.state = PatternState::Suppressed;
                pattern.repeats = 0;
                pattern.consolidation = Some(self.schedule_consolidation(&target.key, &text));
                info!(
                    stream = %target.key,
                    "Pattern repeated {} times, suppressing: {}", pattern.count, text
                );
                Decision::Suppress
            }
        }
    }

    /// Arms resolution timers for the target's suppressed patterns that have gone quiet
    /// and silently forgets quiet patterns that never reached the threshold.
    pub fn check_inactive(&self, key: &TargetKey) {
        let now = Instant::now();
        let inactivity = self.inner.settings.inactivity_timeout;

        let mut table = self.inner.patterns.lock();
        let Some(patterns) = table.get_mut(key) else {
            return;
        };
        let before = patterns.len();
        patterns.retain(|_, pattern| {
            pattern.state == PatternState::Suppressed
                || now.duration_since(pattern.last_seen) <= inactivity
        });
        let evicted = before - patterns.len();
        if evicted > 0 {
            debug!(stream = %key, "Forgot {} idle patterns", evicted);
        }

        for (text, pattern) in patterns.iter_mut() {
            if pattern.state == PatternState::Suppressed
                && pattern.resolution.is_none()
                && now.duration_since(pattern.last_seen) > inactivity
            {
                debug!(stream = %key, "Pattern inactive, scheduling resolution: {}", text);
                pattern.resolution = Some(self.schedule_resolution(key, text));
            }
        }
        if patterns.is_empty() {
            table.remove(key);
        }
    }

    /// Cancels all timers of `key`'s patterns and forgets them. Returns how many were dropped.
    pub fn release_target(&self, key: &TargetKey) -> usize {
        let Some(mut patterns) = self.inner.patterns.lock().remove(key) else {
            return 0;
        };
        for pattern in patterns.values_mut() {
            pattern.cancel_timers();
        }
        patterns.len()
    }

    pub fn stats(&self, key: Option<&TargetKey>) -> PatternStats {
        let table = self.inner.patterns.lock();
        let mut stats = PatternStats::default();
        let selected = table
            .iter()
            .filter(|(k, _)| key.is_none_or(|want| *k == want))
            .flat_map(|(_, patterns)| patterns.values());
        for pattern in selected {
            stats.total += 1;
            match pattern.state {
                PatternState::Active => stats.active += 1,
                PatternState::Suppressed => stats.suppressed += 1,
            }
        }
        stats
    }

    pub fn patterns(&self, key: &TargetKey) -> Vec<PatternSnapshot> {
        let table = self.inner.patterns.lock();
        let mut snapshots: Vec<PatternSnapshot> = table
            .get(key)
            .map(|patterns| {
                patterns
                    .iter()
                    .map(|(text, p)| PatternSnapshot {
                        pattern: text.clone(),
                        state: p.state,
                        count: p.count,
                        consolidation_pending: p.consolidation.is_some(),
                        resolution_pending: p.resolution.is_some(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        snapshots.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        snapshots
    }

    fn timer_id(&self) -> u64 {
        self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn schedule_consolidation(&self, key: &TargetKey, text: &str) -> Timer {
        let id = self.timer_id();
        let engine = self.clone();
        let key = key.clone();
        let text = text.to_string();
        let delay = self.inner.settings.consolidation_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.fire_consolidation(&key, &text, id);
        });
        Timer {
            id,
            handle: handle.abort_handle(),
        }
    }

    fn schedule_resolution(&self, key: &TargetKey, text: &str) -> Timer {
        let id = self.timer_id();
        let engine = self.clone();
        let key = key.clone();
        let text = text.to_string();
        let delay = self.inner.settings.resolution_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.fire_resolution(&key, &text, id);
        });
        Timer {
            id,
            handle: handle.abort_handle(),
        }
    }

    fn fire_consolidation(&self, key: &TargetKey, text: &str, id: u64) {
        let mut table = self.inner.patterns.lock();
        let Some(pattern) = table.get_mut(key).and_then(|p| p.get_mut(text)) else {
            return;
        };
        if pattern.consolidation.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        pattern.consolidation = None;

        let message = consolidation_message(pattern, text);
        match self.inner.queue.enqueue(message) {
            Ok(()) => {
                debug!(stream = %key, "Queued consolidation summary for pattern: {}", text);
                pattern.count = 0;
                pattern.repeats = 0;
            }
            Err(e) => {
                self.inner.metrics.error();
                error!(
                    stream = %key,
                    "Failed to queue consolidation summary, retrying in {:?}: {}",
                    self.inner.settings.consolidation_delay,
                    e
                );
                pattern.consolidation = Some(self.schedule_consolidation(key, text));
            }
        }
    }

    fn fire_resolution(&self, key: &TargetKey, text: &str, id: u64) {
        let mut table = self.inner.patterns.lock();
        let Some(patterns) = table.get_mut(key) else {
            return;
        };
        let Some(pattern) = patterns.get_mut(text) else {
            return;
        };
        if pattern.resolution.as_ref().map(|t| t.id) != Some(id) {
            return;
        }
        pattern.resolution = None;

        if self.inner.settings.stopped_messages {
            let message = resolution_message(pattern, text);
            if let Err(e) = self.inner.queue.enqueue(message) {
                // Keep the record; the next inactivity check re-arms the timer.
                self.inner.metrics.error();
                error!(stream = %key, "Failed to queue resolution message: {}", e);
                return;
            }
        }

        if let Some(mut pattern) = patterns.remove(text) {
            pattern.cancel_timers();
        }
        if patterns.is_empty() {
            table.remove(key);
        }
        info!(stream = %key, "Pattern resolved: {}", text);
    }
}

fn pod_fields(target: &Target, level: LogLevel) -> Vec<crate::types::MessageField> {
    vec![
        field("Pod", format!("`{}`", target.key.pod)),
        field("Namespace", format!("`{}`", target.key.namespace)),
        field("Log Level", level.as_str().to_uppercase()),
    ]
}

fn consolidation_message(pattern: &Pattern, text: &str) -> Message {
    let target = &pattern.target;
    let mut fields = pod_fields(target, pattern.level);
    fields.push(field("Count", pattern.count.to_string()));
    fields.push(field(
        "Duration",
        format!("{} seconds", pattern.first_seen.elapsed().as_secs()),
    ));

    Message {
        channel: target.channel.clone(),
        kind: MessageKind::Consolidation,
        level: pattern.level,
        title: format!(
            "🔄 Repeated {} Pattern - {}",
            pattern.level.title(),
            target.key.pod
        ),
        fields,
        body: text.to_string(),
        footer: format!(
            ":clock1: Last seen {} seconds ago",
            pattern.last_seen.elapsed().as_secs()
        ),
        created_at: chrono::Utc::now(),
    }
}

fn resolution_message(pattern: &Pattern, text: &str) -> Message {
    let target = &pattern.target;
    let title = match pattern.level {
        LogLevel::Error | LogLevel::Warn => {
            format!("✅ {} Pattern Resolved", pattern.level.title())
        }
        LogLevel::Debug => "🔍 Debug Pattern Stopped".to_string(),
        LogLevel::Info => "ℹ️ Info Pattern Stopped".to_string(),
    };
    let mut fields = pod_fields(target, pattern.level);
    fields.push(field(
        "Total Occurrences",
        (pattern.count + pattern.repeats).to_string(),
    ));
    let now = chrono::Utc::now();

    Message {
        channel: target.channel.clone(),
        kind: MessageKind::Resolution,
        level: pattern.level,
        title: format!("{} - {}", title, target.key.pod),
        fields,
        body: text.to_string(),
        footer: format!(
            ":white_check_mark: Resolved at {}",
            now.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        created_at: now,
    }
}
