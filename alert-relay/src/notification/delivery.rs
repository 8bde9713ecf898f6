//! Single send attempt: sender lookup, timeout budget and counters.
//!
//! Shared by the dispatcher fan-out and the retry sweep so both take the same
//! path through a channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::channels::ChannelSet;
use crate::domain::{AttemptOutcome, Channel};
use crate::metrics::{AlertCounter, AlertMetrics};

/// Default per-send timeout budget.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(15);

pub struct DeliveryExecutor {
    channels: ChannelSet,
    metrics: Arc<dyn AlertMetrics>,
    send_timeout: Duration,
}

impl DeliveryExecutor {
    pub fn new(channels: ChannelSet, metrics: Arc<dyn AlertMetrics>, send_timeout: Duration) -> Self {
        Self {
            channels,
            metrics,
            send_timeout,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub fn has_channel(&self, channel: Channel) -> bool {
        self.channels.get(channel).is_some()
    }

    /// Send once. Never fails: every error becomes `AttemptOutcome::Failed`.
    pub async fn attempt(
        &self,
        channel: Channel,
        destination: &str,
        subject: &str,
        content: &str,
    ) -> AttemptOutcome {
        self.metrics.increment(AlertCounter::SendAttempt(channel));

        let Some(sender) = self.channels.get(channel) else {
            self.metrics.increment(AlertCounter::SendFailure(channel));
            warn!(%channel, destination, "Channel not configured");
            return AttemptOutcome::Failed {
                error: format!("{channel} channel is not configured"),
            };
        };

        let started = Instant::now();
        let result =
            tokio::time::timeout(self.send_timeout, sender.send(destination, subject, content))
                .await;
        self.metrics.record_latency(channel, started.elapsed());

        match result {
            Ok(Ok(delivery_id)) => {
                self.metrics.increment(AlertCounter::SendSuccess(channel));
                debug!(%channel, destination, delivery_id = %delivery_id, "Send succeeded");
                AttemptOutcome::Sent { delivery_id }
            }
            Ok(Err(e)) => {
                self.metrics.increment(AlertCounter::SendFailure(channel));
                warn!(%channel, destination, error = %e, "Send failed");
                AttemptOutcome::Failed {
                    error: e.to_string(),
                }
            }
            Err(_) => {
                self.metrics.increment(AlertCounter::SendFailure(channel));
                warn!(%channel, destination, timeout = ?self.send_timeout, "Send timed out");
                AttemptOutcome::Failed {
                    error: format!("{channel} send timed out after {:?}", self.send_timeout),
                }
            }
        }
    }
}
