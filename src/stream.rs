//! Per-container poll workers.
//!
//! Each worker reads its container's log through a [`LogSource`], filters the
//! lines, asks the consolidation engine whether to forward them and batches the
//! forwarded ones into messages for the delivery queue.

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::consolidation::{ConsolidationEngine, Decision, PatternStats};
use crate::delivery::DeliveryQueue;
use crate::error::SourceError;
use crate::metrics::Metrics;
use crate::types::{LogEntry, LogLevel, MATCH_ALL, Message, MessageKind, Target, TargetKey, field};

/// Point-in-time log reader. The poll loop is the only place that turns it into a stream.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self, target: &Target) -> Result<String, SourceError>;

    /// Drops any per-target read state once the target stops.
    fn release(&self, _key: &TargetKey) {}
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub poll_interval: Duration,
    pub stale_after: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum LineFilter {
    All,
    Pattern(Regex),
    Invalid(String),
}

impl LineFilter {
    fn compile(expr: &str) -> Self {
        let expr = expr.trim();
        if expr.is_empty() || expr == MATCH_ALL {
            return LineFilter::All;
        }
        match RegexBuilder::new(expr).case_insensitive(true).build() {
            Ok(re) => LineFilter::Pattern(re),
            Err(e) => LineFilter::Invalid(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStatus {
    pub active: bool,
    pub buffered: usize,
    pub last_flush: Option<Duration>,
    pub patterns: PatternStats,
}

struct StreamWorker {
    target: Arc<Target>,
    filter: LineFilter,
    buffer: Vec<LogEntry>,
    last_flush_at: Option<Instant>,
    active: bool,
}

struct Shared {
    source: Arc<dyn LogSource>,
    engine: ConsolidationEngine,
    queue: DeliveryQueue,
    metrics: Arc<Metrics>,
    settings: StreamSettings,
}

struct WorkerHandle {
    worker: Arc<SyncMutex<StreamWorker>>,
    abort: AbortHandle,
}

pub struct StreamManager {
    shared: Arc<Shared>,
    workers: Mutex<HashMap<TargetKey, WorkerHandle>>,
}

impl StreamManager {
    pub fn new(
        source: Arc<dyn LogSource>,
        engine: ConsolidationEngine,
        queue: DeliveryQueue,
        metrics: Arc<Metrics>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                engine,
                queue,
                metrics,
                settings,
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts polling `target`. Returns false if a worker for the same identity already runs.
    pub async fn start(&self, target: Target) -> bool {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&target.key) {
            debug!("Stream {} is already active", target.key);
            return false;
        }

        let target = Arc::new(target);
        let filter = LineFilter::compile(&target.filter);
        if let LineFilter::Invalid(err) = &filter {
            warn!(
                "Invalid filter '{}' for {}: {}; every line will be dropped",
                target.filter, target.key, err
            );
        }

        let worker = Arc::new(SyncMutex::new(StreamWorker {
            target: target.clone(),
            filter,
            buffer: Vec::new(),
            last_flush_at: None,
            active: true,
        }));
        let handle = tokio::spawn(poll_loop(self.shared.clone(), worker.clone()));

        workers.insert(
            target.key.clone(),
            WorkerHandle {
                worker,
                abort: handle.abort_handle(),
            },
        );
        self.shared.metrics.set_active_streams(workers.len());
        info!("Started log streaming for {}", target.key);
        true
    }

    /// Stops the worker for `key`, flushing its buffer. Unknown keys are a no-op returning false.
    pub async fn stop(&self, key: &TargetKey) -> bool {
        let mut workers = self.workers.lock().await;
        let Some(handle) = workers.remove(key) else {
            return false;
        };
        self.shared.metrics.set_active_streams(workers.len());
        drop(workers);

        self.teardown(key, handle);
        true
    }

    /// Stops every container stream of one pod.
    pub async fn stop_pod(&self, namespace: &str, pod: &str) -> usize {
        let mut workers = self.workers.lock().await;
        let keys: Vec<TargetKey> = workers
            .keys()
            .filter(|k| k.belongs_to(namespace, pod))
            .cloned()
            .collect();
        let handles: Vec<(TargetKey, WorkerHandle)> = keys
            .into_iter()
            .filter_map(|k| workers.remove(&k).map(|h| (k, h)))
            .collect();
        self.shared.metrics.set_active_streams(workers.len());
        drop(workers);

        let stopped = handles.len();
        for (key, handle) in handles {
            self.teardown(&key, handle);
        }
        stopped
    }

    pub async fn stop_all(&self) {
        let handles: Vec<(TargetKey, WorkerHandle)> =
            self.workers.lock().await.drain().collect();
        self.shared.metrics.set_active_streams(0);
        info!("Stopping {} log streams", handles.len());
        for (key, handle) in handles {
            self.teardown(&key, handle);
        }
    }

    fn teardown(&self, key: &TargetKey, handle: WorkerHandle) {
        handle.abort.abort();
        {
            // Holding the worker lock fences off a poll cycle that is mid-flight.
            let mut worker = handle.worker.lock();
            worker.active = false;
            if !worker.buffer.is_empty() {
                let pending = worker.buffer.len();
                if let Err(e) = worker.flush(&self.shared) {
                    self.shared.metrics.error();
                    error!("Lost {} buffered lines for {} on stop: {}", pending, key, e);
                }
            }
            let released = self.shared.engine.release_target(key);
            debug!("Released {} patterns for {}", released, key);
        }
        self.shared.source.release(key);
        info!("Stopped log streaming for {}", key);
    }

    #[cfg(test)]
    pub async fn is_streaming(&self, key: &TargetKey) -> bool {
        self.workers.lock().await.contains_key(key)
    }

    #[cfg(test)]
    pub async fn active_streams(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn target(&self, key: &TargetKey) -> Option<Arc<Target>> {
        self.workers
            .lock()
            .await
            .get(key)
            .map(|h| h.worker.lock().target.clone())
    }

    pub async fn keys(&self) -> Vec<TargetKey> {
        let mut keys: Vec<TargetKey> = self.workers.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn keys_for_pod(&self, namespace: &str, pod: &str) -> Vec<TargetKey> {
        self.workers
            .lock()
            .await
            .keys()
            .filter(|k| k.belongs_to(namespace, pod))
            .cloned()
            .collect()
    }

    pub async fn status(&self, key: &TargetKey) -> Option<StreamStatus> {
        let workers = self.workers.lock().await;
        let handle = workers.get(key)?;
        let worker = handle.worker.lock();
        Some(StreamStatus {
            active: worker.active,
            buffered: worker.buffer.len(),
            last_flush: worker.last_flush_at.map(|at| at.elapsed()),
            patterns: self.shared.engine.stats(Some(key)),
        })
    }
}

async fn poll_loop(shared: Arc<Shared>, worker: Arc<SyncMutex<StreamWorker>>) {
    let target = worker.lock().target.clone();
    let interval = shared.settings.poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let fetched = shared.source.fetch(&target).await;

        let mut state = worker.lock();
        if !state.active {
            break;
        }
        match fetched {
            Ok(text) => state.ingest(&shared, &text),
            Err(e) => {
                // Transient: try again next cycle.
                shared.metrics.error();
                warn!("Error polling logs for {}: {}", target.key, e);
            }
        }
        state.maybe_flush(&shared);
        shared.engine.check_inactive(&target.key);
    }
}

impl StreamWorker {
    fn ingest(&mut self, shared: &Shared, text: &str) {
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            shared.metrics.line_processed();
            if let Some(level) = self.accept(shared, line) {
                match shared.engine.record(&self.target, line) {
                    Decision::Suppress => shared.metrics.line_suppressed(),
                    Decision::Forward => self.buffer.push(LogEntry {
                        timestamp: chrono::Utc::now(),
                        received_at: Instant::now(),
                        line: line.to_string(),
                        level,
                    }),
                }
            }
            self.maybe_flush(shared);
        }
    }

    /// Level and filter check. Returns the detected level for lines that pass.
    fn accept(&self, shared: &Shared, line: &str) -> Option<LogLevel> {
        let level = LogLevel::detect(line);
        if level < self.target.min_level {
            shared.metrics.line_filtered();
            return None;
        }
        match &self.filter {
            LineFilter::All => Some(level),
            LineFilter::Pattern(re) if re.is_match(line) => Some(level),
            LineFilter::Pattern(_) => {
                shared.metrics.line_filtered();
                None
            }
            LineFilter::Invalid(err) => {
                shared.metrics.line_filtered();
                shared.metrics.error();
                error!(
                    "Invalid filter regex '{}' for {}: {}",
                    self.target.filter, self.target.key, err
                );
                None
            }
        }
    }

    fn should_flush(&self, settings: &StreamSettings, now: Instant) -> bool {
        let Some(oldest) = self.buffer.first() else {
            return false;
        };
        if let Some(last) = self.last_flush_at
            && now.duration_since(last) < self.target.cooldown
        {
            return false;
        }
        self.buffer.len() >= self.target.max_lines
            || now.duration_since(oldest.received_at) > settings.stale_after
    }

    fn maybe_flush(&mut self, shared: &Shared) {
        if !self.should_flush(&shared.settings, Instant::now()) {
            return;
        }
        if let Err(e) = self.flush(shared) {
            shared.metrics.error();
            warn!(
                "Failed to queue {} lines for {}, keeping buffer: {}",
                self.buffer.len(),
                self.target.key,
                e
            );
        }
    }

    /// Moves the whole buffer into one message. The buffer is untouched if enqueueing fails.
    fn flush(&mut self, shared: &Shared) -> Result<(), crate::error::DeliveryError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let message = format_batch(&self.target, &self.buffer);
        shared.queue.enqueue(message)?;
        debug!("Queued {} log lines for {}", self.buffer.len(), self.target.channel);
        self.buffer.clear();
        self.last_flush_at = Some(Instant::now());
        Ok(())
    }
}

/// Builds one notification from buffered lines; the most severe line picks the header.
pub fn format_batch(target: &Target, entries: &[LogEntry]) -> Message {
    let level = entries
        .iter()
        .map(|e| e.level)
        .max()
        .unwrap_or(LogLevel::Info);
    let header = match level {
        LogLevel::Error => "🚨 *Critical Error*",
        LogLevel::Warn => "⚠️ *Warning*",
        LogLevel::Debug => "🔍 *Debug Info*",
        LogLevel::Info => "ℹ️ *Log Update*",
    };
    let key = &target.key;

    let body = entries
        .iter()
        .map(|e| {
            format!(
                "[{}] {}/{}: {}",
                e.timestamp.format("%H:%M:%S"),
                key.pod,
                key.container,
                e.line
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let now = chrono::Utc::now();

    Message {
        channel: target.channel.clone(),
        kind: MessageKind::LogBatch,
        level,
        title: format!("{} - {} ({})", header, key.pod, key.namespace),
        fields: vec![
            field("Pod", format!("`{}`", key.pod)),
            field("Namespace", format!("`{}`", key.namespace)),
            field("Container", format!("`{}`", key.container)),
            field("Log Level", level.as_str().to_uppercase()),
        ],
        body,
        footer: format!(":clock1: Sent at {}", now.format("%Y-%m-%d %H:%M:%S UTC")),
        created_at: now,
    }
}
