//! Observability collaborator for the alert pipeline.
//!
//! Services receive an `Arc<dyn AlertMetrics>`; the process wires in
//! [`MetricsCollector`], tests use [`NoopMetrics`] or inspect a collector's
//! snapshot.

mod collector;

pub use collector::{ChannelCounters, MetricsCollector, MetricsSnapshot};

use std::time::Duration;

use crate::domain::Channel;

/// Monotonic events counted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertCounter {
    Triggered,
    DuplicateDetected,
    NoContacts,
    ContactResolutionFailed,
    Escalated,
    SendAttempt(Channel),
    SendSuccess(Channel),
    SendFailure(Channel),
    RetryClaimed,
    RetrySucceeded,
    RetryExhausted,
    /// An attempt whose message log row could not be written.
    LogWriteFailed,
}

pub trait AlertMetrics: Send + Sync {
    /// Count one occurrence of `counter`.
    fn increment(&self, counter: AlertCounter);

    /// Record how long one transport call took.
    fn record_latency(&self, channel: Channel, elapsed: Duration);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl AlertMetrics for NoopMetrics {
    fn increment(&self, _counter: AlertCounter) {}

    fn record_latency(&self, _channel: Channel, _elapsed: Duration) {}
}
