use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{DeliveryConfig, ShutdownPolicy};
use crate::error::DeliveryError;
use crate::metrics::Metrics;
use crate::slack::NotificationSink;
use crate::types::Message;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub send_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub honor_backoff: bool,
    pub capacity: usize,
    pub shutdown: ShutdownPolicy,
    pub drain_timeout: Duration,
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(cfg: &DeliveryConfig) -> Self {
        Self {
            send_interval: Duration::from_millis(cfg.send_interval_ms),
            max_retries: cfg.max_retries,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            honor_backoff: cfg.honor_backoff,
            capacity: cfg.queue_capacity,
            shutdown: cfg.shutdown,
            drain_timeout: Duration::from_secs(cfg.drain_timeout_secs),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub message: Message,
    pub attempts: u32,
    pub enqueued_at: Instant,
    /// Earliest instant the item may be sent; later than `enqueued_at` only for retries.
    pub ready_at: Instant,
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay * attempt
}

enum Next {
    Send(QueueItem),
    WaitUntil(Instant),
    Idle,
}

struct QueueInner {
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    closed: AtomicBool,
    settings: DeliverySettings,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

/// Single-consumer FIFO in front of the notification sink.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Creates the queue and spawns its drain loop on the current runtime.
    pub fn start(
        sink: Arc<dyn NotificationSink>,
        settings: DeliverySettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let inner = Arc::new(QueueInner {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            settings,
            sink,
            metrics,
            drain: Mutex::new(None),
        });

        let handle = tokio::spawn(drain_loop(inner.clone()));
        *inner.drain.lock() = Some(handle);

        Self { inner }
    }

    pub fn enqueue(&self, message: Message) -> Result<(), DeliveryError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::Closed);
        }

        let now = Instant::now();
        {
            let mut items = self.inner.items.lock();
            if items.len() >= self.inner.settings.capacity {
                return Err(DeliveryError::Full(items.len()));
            }
            items.push_back(QueueItem {
                message,
                attempts: 0,
                enqueued_at: now,
                ready_at: now,
            });
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting messages, then drains or abandons what is pending.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();

        let Some(mut handle) = self.inner.drain.lock().take() else {
            return;
        };

        match self.inner.settings.shutdown {
            ShutdownPolicy::Drain => {
                let pending = self.len();
                info!("Draining {} pending notifications", pending);
                let timeout = self.inner.settings.drain_timeout;
                if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                    handle.abort();
                    let abandoned = self.abandon();
                    warn!(
                        "Drain timed out after {:?}, abandoned {} notifications",
                        timeout, abandoned
                    );
                }
            }
            ShutdownPolicy::Abandon => {
                handle.abort();
                let abandoned = self.abandon();
                if abandoned > 0 {
                    warn!("Abandoned {} pending notifications", abandoned);
                }
            }
        }
    }

    fn abandon(&self) -> usize {
        let mut items = self.inner.items.lock();
        let count = items.len();
        items.clear();
        count
    }
}

fn next_item(items: &mut VecDeque<QueueItem>, now: Instant) -> Next {
    if let Some(pos) = items.iter().position(|item| item.ready_at <= now) {
        return match items.remove(pos) {
            Some(item) => Next::Send(item),
            None => Next::Idle,
        };
    }
    match items.iter().map(|item| item.ready_at).min() {
        Some(at) => Next::WaitUntil(at),
        None => Next::Idle,
    }
}

async fn drain_loop(inner: Arc<QueueInner>) {
    debug!("Delivery drain loop started ({})", inner.sink.name());
    loop {
        let next = next_item(&mut inner.items.lock(), Instant::now());
        match next {
            Next::Send(item) => {
                deliver(&inner, item).await;
                tokio::time::sleep(inner.settings.send_interval).await;
            }
            Next::WaitUntil(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = inner.notify.notified() => {}
                }
            }
            Next::Idle => {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.notify.notified().await;
            }
        }
    }
    debug!("Delivery drain loop finished");
}

async fn deliver(inner: &QueueInner, mut item: QueueItem) {
    match inner.sink.send(&item.message).await {
        Ok(()) => {
            inner.metrics.message_sent();
            debug!(
                "Delivered {:?} message to {} after {:?}",
                item.message.kind,
                item.message.channel,
                item.enqueued_at.elapsed()
            );
        }
        Err(e) if item.attempts < inner.settings.max_retries => {
            inner.metrics.error();
            item.attempts += 1;
            let delay = backoff_delay(inner.settings.retry_delay, item.attempts);
            item.ready_at = if inner.settings.honor_backoff {
                Instant::now() + delay
            } else {
                Instant::now()
            };
            warn!(
                "Failed to send message to {} (attempt {}), retrying in {:?}: {}",
                item.message.channel, item.attempts, delay, e
            );
            inner.items.lock().push_back(item);
        }
        Err(e) => {
            inner.metrics.error();
            error!(
                "Dropping message to {} after {} retries: {}",
                item.message.channel, item.attempts, e
            );
        }
    }
}
