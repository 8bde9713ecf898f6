//! Periodic retry sweep over failed message log entries.
//!
//! Each entry is claimed with a single conditional update before it is
//! resent, so overlapping sweeps (or an operator retry racing the sweep)
//! never send the same retry twice. The claim holds a lease covering the send
//! timeout, which keeps the entry exclusive even with a zero retry delay.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::delivery::DeliveryExecutor;
use crate::database::repositories::MessageLogRepository;
use crate::domain::{AttemptOutcome, MessageLog, RetryPolicy};
use crate::metrics::{AlertCounter, AlertMetrics};
use crate::{Error, Result};

/// Slack on top of the send timeout before a claim may be taken over.
const CLAIM_LEASE_GRACE: Duration = Duration::from_secs(30);

/// Retry sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySchedulerConfig {
    /// Seconds between sweeps (default: 5 minutes).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub policy: RetryPolicy,
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

impl Default for RetrySchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            policy: RetryPolicy::default(),
        }
    }
}

/// Result of retrying one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Sent,
    /// The resend failed; `exhausted` means no further retry will happen.
    Failed { exhausted: bool },
    /// Retry budget already used up; nothing was sent.
    Exhausted,
    /// Another worker claimed the entry first, or it is no longer due.
    NotClaimed,
}

/// Counts for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub found: usize,
    pub sent: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct RetryScheduler {
    message_logs: Arc<dyn MessageLogRepository>,
    delivery: Arc<DeliveryExecutor>,
    metrics: Arc<dyn AlertMetrics>,
    config: RetrySchedulerConfig,
    running: AtomicBool,
}

impl RetryScheduler {
    pub fn new(
        message_logs: Arc<dyn MessageLogRepository>,
        delivery: Arc<DeliveryExecutor>,
        metrics: Arc<dyn AlertMetrics>,
        config: RetrySchedulerConfig,
    ) -> Self {
        Self {
            message_logs,
            delivery,
            metrics,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the sweep loop; it exits when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::SeqCst);
            let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?period, "Retry scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.run_sweep().await;
                        if report.found > 0 {
                            info!(
                                found = report.found,
                                sent = report.sent,
                                failed = report.failed,
                                exhausted = report.exhausted,
                                skipped = report.skipped,
                                errors = report.errors,
                                "Retry sweep finished"
                            );
                        }
                    }
                }
            }

            self.running.store(false, Ordering::SeqCst);
            info!("Retry scheduler stopped");
        })
    }

    /// Process every entry that is due at this moment.
    ///
    /// Never fails as a whole: a broken entry is counted and logged, and the
    /// remaining entries are still processed.
    pub async fn run_sweep(&self) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let due = match self.message_logs.find_ready_for_retry(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to load retry candidates");
                report.errors += 1;
                return report;
            }
        };
        report.found = due.len();
        if due.is_empty() {
            return report;
        }
        debug!(count = due.len(), "Retry candidates found");

        let results = join_all(due.iter().map(|log| self.retry_one(log, now))).await;
        for (log, result) in due.iter().zip(results) {
            match result {
                Ok(RetryOutcome::Sent) => report.sent += 1,
                Ok(RetryOutcome::Failed { exhausted }) => {
                    report.failed += 1;
                    if exhausted {
                        report.exhausted += 1;
                    }
                }
                Ok(RetryOutcome::Exhausted) => report.exhausted += 1,
                Ok(RetryOutcome::NotClaimed) => report.skipped += 1,
                Err(e) => {
                    error!(log_id = %log.id, error = %e, "Retry failed");
                    report.errors += 1;
                }
            }
        }
        report
    }

    /// Claim and resend one entry.
    pub async fn retry_one(&self, log: &MessageLog, now: DateTime<Utc>) -> Result<RetryOutcome> {
        let max_retries = self.message_logs.max_retries();
        if log.retry_count >= max_retries {
            warn!(
                log_id = %log.id,
                retry_count = log.retry_count,
                "Retry budget exhausted, leaving entry failed"
            );
            return Ok(RetryOutcome::Exhausted);
        }

        let delay = self.config.policy.delay_for_retry(log.retry_count);
        let next_retry_at = now + to_chrono(delay)?;
        let lease_until = now + to_chrono(self.delivery.send_timeout() + CLAIM_LEASE_GRACE)?;

        if !self
            .message_logs
            .mark_retrying(&log.id, now, next_retry_at, lease_until)
            .await?
        {
            debug!(log_id = %log.id, "Retry claim lost");
            return Ok(RetryOutcome::NotClaimed);
        }
        self.metrics.increment(AlertCounter::RetryClaimed);
        info!(
            log_id = %log.id,
            channel = %log.channel,
            attempt = log.retry_count + 1,
            "Retrying send"
        );

        let outcome = self
            .delivery
            .attempt(log.channel, &log.destination, &log.subject, &log.content)
            .await;
        let updated = self
            .message_logs
            .record_attempt_outcome(&log.id, &outcome, Utc::now())
            .await?;

        match outcome {
            AttemptOutcome::Sent { .. } => {
                self.metrics.increment(AlertCounter::RetrySucceeded);
                Ok(RetryOutcome::Sent)
            }
            AttemptOutcome::Failed { error } => {
                let exhausted = updated.retry_count >= max_retries;
                if exhausted {
                    self.metrics.increment(AlertCounter::RetryExhausted);
                    warn!(
                        log_id = %log.id,
                        channel = %log.channel,
                        error = %error,
                        "Final retry failed"
                    );
                }
                Ok(RetryOutcome::Failed { exhausted })
            }
        }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::Other(format!("retry delay out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{
        NotificationRepository, SqlxMessageLogRepository, SqlxNotificationRepository,
    };
    use crate::database::test_pool;
    use crate::domain::{
        Channel, EmergencyKind, GeoPoint, MessageStatus, Notification, NotificationStatus,
    };
    use crate::metrics::{MetricsCollector, NoopMetrics};
    use crate::notification::channels::{ChannelSender, ChannelSet};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` sends, then succeeds after `latency`.
    struct Flaky {
        failures: usize,
        latency: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChannelSender for Flaky {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        async fn send(&self, _: &str, _: &str, _: &str) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            if call < self.failures {
                Err(Error::channel_send(Channel::Email, "smtp down"))
            } else {
                Ok(format!("msg-{call}"))
            }
        }
    }

    async fn setup(
        failures: usize,
    ) -> (
        Arc<SqlxMessageLogRepository>,
        Arc<Flaky>,
        RetryScheduler,
        Arc<MetricsCollector>,
    ) {
        let (logs, _, sender, scheduler, metrics) = setup_with(failures, Duration::ZERO).await;
        (logs, sender, scheduler, metrics)
    }

    async fn setup_with(
        failures: usize,
        latency: Duration,
    ) -> (
        Arc<SqlxMessageLogRepository>,
        SqlxNotificationRepository,
        Arc<Flaky>,
        RetryScheduler,
        Arc<MetricsCollector>,
    ) {
        let pool = test_pool().await;
        let notifications = SqlxNotificationRepository::new(pool.clone());
        let logs = Arc::new(SqlxMessageLogRepository::new(pool, 3));
        let sender = Arc::new(Flaky {
            failures,
            latency,
            calls: AtomicUsize::new(0),
        });
        let metrics = Arc::new(MetricsCollector::new());
        let delivery = Arc::new(DeliveryExecutor::new(
            ChannelSet::new().with(sender.clone()),
            Arc::new(NoopMetrics),
            Duration::from_secs(5),
        ));
        let config = RetrySchedulerConfig {
            sweep_interval_secs: 1,
            policy: RetryPolicy {
                retry_delay_ms: 0,
                ..RetryPolicy::default()
            },
        };
        let scheduler = RetryScheduler::new(logs.clone(), delivery, metrics.clone(), config);

        let now = Utc::now();
        let notification = Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(1.0, 2.0).unwrap(),
            now,
        );
        notifications.create(&notification).await.unwrap();
        let log = MessageLog::from_attempt(
            &notification.id,
            "u1",
            Some("c1".into()),
            "a@x.com",
            Channel::Email,
            "subject",
            "body",
            AttemptOutcome::Failed {
                error: "smtp down".into(),
            },
            now - chrono::Duration::seconds(1),
        );
        logs.create(&log).await.unwrap();
        (logs, notifications, sender, scheduler, metrics)
    }

    async fn failed_attempt_for(
        notifications: &SqlxNotificationRepository,
        logs: &SqlxMessageLogRepository,
        triggered_at: DateTime<Utc>,
    ) -> Notification {
        let notification = Notification::new(
            "u2",
            EmergencyKind::AiDetected,
            "help",
            GeoPoint::new(1.0, 2.0).unwrap(),
            triggered_at,
        );
        notifications.create(&notification).await.unwrap();
        let log = MessageLog::from_attempt(
            &notification.id,
            "u2",
            None,
            "b@x.com",
            Channel::Email,
            "subject",
            "body",
            AttemptOutcome::Failed {
                error: "smtp down".into(),
            },
            triggered_at,
        );
        logs.create(&log).await.unwrap();
        notification
    }

    #[tokio::test]
    async fn test_sweep_resends_and_marks_sent() {
        let (logs, sender, scheduler, metrics) = setup(0).await;

        let report = scheduler.run_sweep().await;
        assert_eq!(report.found, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);

        let sent = logs.list_by_status(MessageStatus::Sent, 10).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].retry_count, 1);
        assert_eq!(sent[0].delivery_id.as_deref(), Some("msg-0"));
        assert!(sent[0].next_retry_at.is_none());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retries_claimed, 1);
        assert_eq!(snapshot.retries_succeeded, 1);

        // Nothing left to do.
        assert_eq!(scheduler.run_sweep().await.found, 0);
    }

    #[tokio::test]
    async fn test_sweep_stops_after_max_retries() {
        let (logs, sender, scheduler, metrics) = setup(usize::MAX).await;

        for _ in 0..5 {
            scheduler.run_sweep().await;
        }
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);

        let failed = logs.list_by_status(MessageStatus::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 3);
        assert!(failed[0].next_retry_at.is_none());
        assert_eq!(metrics.snapshot().retries_exhausted, 1);

        let outcome = scheduler.retry_one(&failed[0], Utc::now()).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Exhausted);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stale_snapshot_loses_claim() {
        let (logs, sender, scheduler, _) = setup(0).await;
        let stale = logs
            .find_ready_for_retry(Utc::now())
            .await
            .unwrap()
            .remove(0);

        let first = scheduler.retry_one(&stale, Utc::now()).await.unwrap();
        assert_eq!(first, RetryOutcome::Sent);

        let second = scheduler.retry_one(&stale, Utc::now()).await.unwrap();
        assert_eq!(second, RetryOutcome::NotClaimed);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let (_, _, scheduler, _) = setup(0).await;
        let scheduler = Arc::new(scheduler);
        let cancel = CancellationToken::new();
        let handle = scheduler.clone().start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_running());
        cancel.cancel();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_sweep_skips_expired_and_false_alarm_notifications() {
        let (logs, notifications, sender, scheduler, _) = setup_with(0, Duration::ZERO).await;
        let now = Utc::now();

        // Consume the fixture's own entry so only the inert ones remain.
        assert_eq!(scheduler.run_sweep().await.sent, 1);

        failed_attempt_for(&notifications, &logs, now - chrono::Duration::days(2)).await;
        assert_eq!(notifications.expire_overdue(now).await.unwrap(), 1);

        let mut false_alarm = failed_attempt_for(&notifications, &logs, now).await;
        false_alarm.mark_false_alarm(Utc::now()).unwrap();
        notifications
            .update(&false_alarm, NotificationStatus::Pending)
            .await
            .unwrap();

        let report = scheduler.run_sweep().await;
        assert_eq!(report.found, 0);
        assert_eq!(report.sent, 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            logs.list_by_status(MessageStatus::Failed, 10)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_send_once_with_zero_delay() {
        let (logs, _, sender, scheduler, _) =
            setup_with(0, Duration::from_millis(300)).await;

        let (a, b) = tokio::join!(scheduler.run_sweep(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            scheduler.run_sweep().await
        });

        assert_eq!(a.sent + b.sent, 1);
        assert_eq!(a.errors + b.errors, 0);
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        let sent = logs.list_by_status(MessageStatus::Sent, 10).await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].retry_count, 1);
    }
}
