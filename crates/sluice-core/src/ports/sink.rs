//! Metrics sink port.

use std::sync::Arc;

use crate::domain::MetricEvent;
use crate::ports::{Clock, SystemClock};

/// Accepts structured events. Side-effect free to callers: `record` must not
/// block, fail, or panic, and must tolerate concurrent sends (every worker
/// holds a reference).
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Discards everything. The default for embedding and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record(&self, _event: MetricEvent) {}
}

/// Forwards events to `tracing`, stamped with wall-clock time.
pub struct LogSink {
    clock: Arc<dyn Clock>,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for LogSink {
    fn record(&self, event: MetricEvent) {
        tracing::debug!(
            target: "sluice::metrics",
            at = %self.clock.now().to_rfc3339(),
            event = ?event,
        );
    }
}
