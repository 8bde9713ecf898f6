//! Periodic housekeeping: notification expiry and message-log retention.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::database::repositories::{MessageLogRepository, NotificationRepository};

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Interval between runs in seconds (default: 1 hour).
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Message logs older than this are purged (default: 30 days).
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
}

fn default_interval_secs() -> u64 {
    60 * 60
}

fn default_log_retention_days() -> i64 {
    30
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub notifications_expired: u64,
    pub logs_purged: u64,
}

pub struct MaintenanceScheduler {
    notifications: Arc<dyn NotificationRepository>,
    message_logs: Arc<dyn MessageLogRepository>,
    config: MaintenanceConfig,
    running: AtomicBool,
}

impl MaintenanceScheduler {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        message_logs: Arc<dyn MessageLogRepository>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            notifications,
            message_logs,
            config,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the maintenance loop; it exits when `cancel` fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.running.store(true, Ordering::SeqCst);
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_maintenance().await {
                            tracing::error!(error = %e, "Maintenance error");
                        }
                    }
                }
            }

            self.running.store(false, Ordering::SeqCst);
            tracing::info!("Maintenance scheduler stopped");
        })
    }

    /// Run all maintenance tasks once.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = Utc::now();

        let notifications_expired = self.notifications.expire_overdue(now).await?;
        if notifications_expired > 0 {
            tracing::info!(count = notifications_expired, "Expired overdue notifications");
        }

        let cutoff = now - chrono::Duration::days(self.config.log_retention_days);
        let logs_purged = self.message_logs.delete_older_than(cutoff).await?;
        if logs_purged > 0 {
            tracing::info!(count = logs_purged, %cutoff, "Purged old message logs");
        }

        Ok(MaintenanceReport {
            notifications_expired,
            logs_purged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{SqlxMessageLogRepository, SqlxNotificationRepository};
    use crate::database::test_pool;
    use crate::domain::{
        AttemptOutcome, Channel, EmergencyKind, GeoPoint, MessageLog, Notification,
        NotificationStatus,
    };

    #[tokio::test]
    async fn test_run_maintenance_expires_and_purges() {
        let pool = test_pool().await;
        let notifications = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let logs = Arc::new(SqlxMessageLogRepository::new(pool, 3));

        let now = Utc::now();
        let stale = Notification::new(
            "u1",
            EmergencyKind::Audio,
            "help",
            GeoPoint::new(0.0, 0.0).unwrap(),
            now - chrono::Duration::days(40),
        );
        notifications.create(&stale).await.unwrap();
        let old_log = MessageLog::from_attempt(
            &stale.id,
            "u1",
            None,
            "a@x.com",
            Channel::Email,
            "s",
            "b",
            AttemptOutcome::Sent {
                delivery_id: "d".to_string(),
            },
            now - chrono::Duration::days(40),
        );
        logs.create(&old_log).await.unwrap();

        let scheduler = MaintenanceScheduler::new(
            notifications.clone(),
            logs.clone(),
            MaintenanceConfig::default(),
        );
        let report = scheduler.run_maintenance().await.unwrap();
        assert_eq!(report.notifications_expired, 1);
        assert_eq!(report.logs_purged, 1);

        let after = notifications.get(&stale.id).await.unwrap();
        assert_eq!(after.status, NotificationStatus::Expired);

        let again = scheduler.run_maintenance().await.unwrap();
        assert_eq!(again, MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let pool = test_pool().await;
        let scheduler = Arc::new(MaintenanceScheduler::new(
            Arc::new(SqlxNotificationRepository::new(pool.clone())),
            Arc::new(SqlxMessageLogRepository::new(pool, 3)),
            MaintenanceConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = scheduler.clone().start(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }
}
