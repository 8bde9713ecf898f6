//! Repeat-trigger detection.
//!
//! The signal is advisory: a flagged trigger is counted and logged but is
//! still dispatched in full.
//!
//! The first count runs before the new notification is stored. Two triggers
//! racing through that count would both see nothing, so the dispatcher
//! rechecks once its own row exists. Under that race both may end up flagged.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::Result;
use crate::database::repositories::NotificationRepository;
use crate::domain::Notification;
use crate::metrics::{AlertCounter, AlertMetrics};

/// Default look-back window.
pub const DEFAULT_DUPLICATE_WINDOW_SECS: u64 = 5 * 60;

pub struct DuplicateDetector {
    notifications: Arc<dyn NotificationRepository>,
    metrics: Arc<dyn AlertMetrics>,
    window: Duration,
}

impl DuplicateDetector {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        metrics: Arc<dyn AlertMetrics>,
        window: std::time::Duration,
    ) -> Self {
        Self {
            notifications,
            metrics,
            window: Duration::from_std(window)
                .unwrap_or_else(|_| Duration::seconds(DEFAULT_DUPLICATE_WINDOW_SECS as i64)),
        }
    }

    /// Whether a trigger from `user_id` at `now` repeats a recent one.
    ///
    /// Must be called before the new notification is stored: any earlier
    /// notification inside the window makes this one the second or later.
    pub async fn is_duplicate(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let recent = self
            .notifications
            .count_triggered_between(user_id, now - self.window, now)
            .await?;
        Ok(self.flag(user_id, recent >= 1, recent))
    }

    /// Second look once `notification` itself is stored: any other row for
    /// the user inside the window means a concurrent trigger got in.
    pub async fn recheck_stored(&self, notification: &Notification) -> Result<bool> {
        let now = Utc::now().max(notification.triggered_at);
        let stored = self
            .notifications
            .count_triggered_between(
                &notification.user_id,
                notification.triggered_at - self.window,
                now,
            )
            .await?;
        let others = stored - 1;
        Ok(self.flag(&notification.user_id, others >= 1, others))
    }

    fn flag(&self, user_id: &str, duplicate: bool, recent: i64) -> bool {
        if duplicate {
            self.metrics.increment(AlertCounter::DuplicateDetected);
            info!(
                user_id,
                recent,
                window_secs = self.window.num_seconds(),
                "Possible duplicate emergency trigger"
            );
        }
        duplicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxNotificationRepository;
    use crate::database::test_pool;
    use crate::domain::{EmergencyKind, GeoPoint, Notification};
    use crate::metrics::MetricsCollector;

    #[tokio::test]
    async fn test_second_trigger_within_window_is_flagged() {
        let repo = Arc::new(SqlxNotificationRepository::new(test_pool().await));
        let metrics = Arc::new(MetricsCollector::new());
        let detector = DuplicateDetector::new(
            repo.clone(),
            metrics.clone(),
            std::time::Duration::from_secs(300),
        );
        let now = Utc::now();

        assert!(!detector.is_duplicate("u1", now).await.unwrap());
        let first = Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(0.0, 0.0).unwrap(),
            now - Duration::minutes(2),
        );
        repo.create(&first).await.unwrap();

        assert!(detector.is_duplicate("u1", now).await.unwrap());
        assert!(!detector.is_duplicate("u2", now).await.unwrap());
        assert!(
            !detector
                .is_duplicate("u1", now + Duration::minutes(4))
                .await
                .unwrap()
        );
        assert_eq!(metrics.snapshot().duplicates, 1);
    }

    #[tokio::test]
    async fn test_racing_triggers_are_caught_on_recheck() {
        let repo = Arc::new(SqlxNotificationRepository::new(test_pool().await));
        let metrics = Arc::new(MetricsCollector::new());
        let detector = DuplicateDetector::new(
            repo.clone(),
            metrics.clone(),
            std::time::Duration::from_secs(300),
        );
        let now = Utc::now();

        // Both count before either is stored.
        assert!(!detector.is_duplicate("u1", now).await.unwrap());
        assert!(!detector.is_duplicate("u1", now).await.unwrap());

        let first = Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(0.0, 0.0).unwrap(),
            now,
        );
        repo.create(&first).await.unwrap();
        assert!(!detector.recheck_stored(&first).await.unwrap());

        let second = Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(0.0, 0.0).unwrap(),
            now,
        );
        repo.create(&second).await.unwrap();
        assert!(detector.recheck_stored(&second).await.unwrap());
        assert_eq!(metrics.snapshot().duplicates, 1);
    }
}
