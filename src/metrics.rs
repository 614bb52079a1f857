use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by the stream, consolidation and delivery paths.
#[derive(Debug, Default)]
pub struct Metrics {
    lines_processed: AtomicU64,
    lines_filtered: AtomicU64,
    lines_suppressed: AtomicU64,
    messages_sent: AtomicU64,
    errors: AtomicU64,
    pod_events: AtomicU64,
    active_streams: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lines_processed: u64,
    pub lines_filtered: u64,
    pub lines_suppressed: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub pod_events: u64,
    pub active_streams: u64,
}

impl Metrics {
    pub fn line_processed(&self) {
        self.lines_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn line_filtered(&self) {
        self.lines_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn line_suppressed(&self) {
        self.lines_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pod_event(&self) {
        self.pod_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_streams(&self, count: usize) {
        self.active_streams.store(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lines_processed: self.lines_processed.load(Ordering::Relaxed),
            lines_filtered: self.lines_filtered.load(Ordering::Relaxed),
            lines_suppressed: self.lines_suppressed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            pod_events: self.pod_events.load(Ordering::Relaxed),
            active_streams: self.active_streams.load(Ordering::Relaxed),
        }
    }
}
