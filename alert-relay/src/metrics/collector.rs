//! In-process metrics collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use super::{AlertCounter, AlertMetrics};
use crate::domain::Channel;

#[derive(Debug, Default)]
struct ChannelStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_count: AtomicU64,
}

/// Counters and latency accumulators for the alert pipeline.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    triggered: AtomicU64,
    duplicates: AtomicU64,
    no_contacts: AtomicU64,
    resolution_failures: AtomicU64,
    escalations: AtomicU64,
    retries_claimed: AtomicU64,
    retries_succeeded: AtomicU64,
    retries_exhausted: AtomicU64,
    log_write_failures: AtomicU64,
    channels: DashMap<Channel, ChannelStats>,
    labels: RwLock<HashMap<String, String>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a static label (e.g. instance name) to every snapshot.
    pub fn set_label(&self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.write().insert(key.into(), value.into());
    }

    fn channel_counter(&self, channel: Channel, pick: impl Fn(&ChannelStats) -> &AtomicU64) {
        let stats = self.channels.entry(channel).or_default();
        pick(stats.value()).fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let channels = self
            .channels
            .iter()
            .map(|entry| {
                let stats = entry.value();
                let count = stats.latency_count.load(Ordering::Relaxed);
                let avg_latency_ms = if count == 0 {
                    0.0
                } else {
                    stats.latency_total_ms.load(Ordering::Relaxed) as f64 / count as f64
                };
                (
                    entry.key().to_string(),
                    ChannelCounters {
                        attempts: stats.attempts.load(Ordering::Relaxed),
                        successes: stats.successes.load(Ordering::Relaxed),
                        failures: stats.failures.load(Ordering::Relaxed),
                        avg_latency_ms,
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            triggered: self.triggered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            no_contacts: self.no_contacts.load(Ordering::Relaxed),
            resolution_failures: self.resolution_failures.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            retries_claimed: self.retries_claimed.load(Ordering::Relaxed),
            retries_succeeded: self.retries_succeeded.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            log_write_failures: self.log_write_failures.load(Ordering::Relaxed),
            channels,
            labels: self.labels.read().clone(),
        }
    }
}

impl AlertMetrics for MetricsCollector {
    fn increment(&self, counter: AlertCounter) {
        let global = match counter {
            AlertCounter::Triggered => &self.triggered,
            AlertCounter::DuplicateDetected => &self.duplicates,
            AlertCounter::NoContacts => &self.no_contacts,
            AlertCounter::ContactResolutionFailed => &self.resolution_failures,
            AlertCounter::Escalated => &self.escalations,
            AlertCounter::RetryClaimed => &self.retries_claimed,
            AlertCounter::RetrySucceeded => &self.retries_succeeded,
            AlertCounter::RetryExhausted => &self.retries_exhausted,
            AlertCounter::LogWriteFailed => &self.log_write_failures,
            AlertCounter::SendAttempt(channel) => {
                return self.channel_counter(channel, |s| &s.attempts);
            }
            AlertCounter::SendSuccess(channel) => {
                return self.channel_counter(channel, |s| &s.successes);
            }
            AlertCounter::SendFailure(channel) => {
                return self.channel_counter(channel, |s| &s.failures);
            }
        };
        global.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, channel: Channel, elapsed: Duration) {
        let stats = self.channels.entry(channel).or_default();
        stats
            .latency_total_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        stats.latency_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelCounters {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub triggered: u64,
    pub duplicates: u64,
    pub no_contacts: u64,
    pub resolution_failures: u64,
    pub escalations: u64,
    pub retries_claimed: u64,
    pub retries_succeeded: u64,
    pub retries_exhausted: u64,
    pub log_write_failures: u64,
    /// Keyed by channel name (`EMAIL`, `SMS`, `REALTIME`).
    pub channels: HashMap<String, ChannelCounters>,
    pub labels: HashMap<String, String>,
}

impl MetricsSnapshot {
    pub fn channel(&self, channel: Channel) -> ChannelCounters {
        self.channels
            .get(channel.as_ref())
            .cloned()
            .unwrap_or_default()
    }
}
