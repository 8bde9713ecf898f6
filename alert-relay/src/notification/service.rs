//! Caller and operator operations on stored notifications and message logs.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use super::retry::{RetryOutcome, RetryScheduler};
use crate::database::repositories::{
    MessageLogRepository, MessageLogStats, NotificationRepository, NotificationStats,
};
use crate::domain::{MessageLog, MessageStatus, Notification};
use crate::{Error, Result};

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Aggregate report over everything stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertStats {
    pub notifications: NotificationStats,
    pub message_logs: MessageLogStats,
    /// Share of notifications marked as false alarms, in `[0, 1]`.
    pub false_alarm_rate: f64,
}

pub struct NotificationQueryService {
    notifications: Arc<dyn NotificationRepository>,
    message_logs: Arc<dyn MessageLogRepository>,
    retry: Arc<RetryScheduler>,
}

impl NotificationQueryService {
    pub fn new(
        notifications: Arc<dyn NotificationRepository>,
        message_logs: Arc<dyn MessageLogRepository>,
        retry: Arc<RetryScheduler>,
    ) -> Self {
        Self {
            notifications,
            message_logs,
            retry,
        }
    }

    /// Fetch a notification owned by `caller_id`.
    pub async fn get_notification(
        &self,
        notification_id: &str,
        caller_id: &str,
    ) -> Result<Notification> {
        let notification = self.notifications.get(notification_id).await?;
        ensure_owner(&notification.user_id, caller_id, "notification", notification_id)?;
        Ok(notification)
    }

    /// Newest first.
    pub async fn list_user_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        self.notifications
            .list_by_user(user_id, DEFAULT_LIST_LIMIT)
            .await
    }

    /// Operator resolution: the emergency was handled.
    pub async fn resolve(&self, notification_id: &str, caller_id: &str) -> Result<Notification> {
        let mut notification = self.get_notification(notification_id, caller_id).await?;
        let expected = notification.status;
        notification.resolve(Utc::now())?;
        self.notifications.update(&notification, expected).await?;
        info!(notification_id, caller_id, "Notification resolved");
        Ok(notification)
    }

    pub async fn mark_false_alarm(
        &self,
        notification_id: &str,
        caller_id: &str,
    ) -> Result<Notification> {
        let mut notification = self.get_notification(notification_id, caller_id).await?;
        let expected = notification.status;
        notification.mark_false_alarm(Utc::now())?;
        self.notifications.update(&notification, expected).await?;
        info!(notification_id, caller_id, "Notification marked as false alarm");
        Ok(notification)
    }

    pub async fn get_message_log(&self, log_id: &str, caller_id: &str) -> Result<MessageLog> {
        let log = self.message_logs.get(log_id).await?;
        ensure_owner(&log.user_id, caller_id, "message log", log_id)?;
        Ok(log)
    }

    /// Every attempt made for one notification.
    pub async fn list_message_logs(
        &self,
        notification_id: &str,
        caller_id: &str,
    ) -> Result<Vec<MessageLog>> {
        self.get_notification(notification_id, caller_id).await?;
        self.message_logs.list_by_notification(notification_id).await
    }

    pub async fn list_user_message_logs(&self, user_id: &str) -> Result<Vec<MessageLog>> {
        self.message_logs
            .list_by_user(user_id, DEFAULT_LIST_LIMIT)
            .await
    }

    /// Provider delivery-status callback.
    pub async fn record_delivery_status(
        &self,
        log_id: &str,
        status: MessageStatus,
        delivery_id: Option<&str>,
    ) -> Result<MessageLog> {
        if !matches!(status, MessageStatus::Delivered | MessageStatus::Failed) {
            return Err(Error::validation(format!(
                "delivery callbacks may only report DELIVERED or FAILED, got {status}"
            )));
        }
        let log = self
            .message_logs
            .update_status(log_id, status, delivery_id)
            .await?;
        info!(log_id, status = %log.status, "Delivery status recorded");
        Ok(log)
    }

    /// Operator-triggered re-attempt of one failed entry.
    ///
    /// Goes through the same claim as the sweep, so the retry budget and the
    /// backoff schedule both still apply.
    pub async fn retry_message(&self, log_id: &str) -> Result<RetryOutcome> {
        let log = self.message_logs.get(log_id).await?;
        if !matches!(log.status, MessageStatus::Failed | MessageStatus::Retry) {
            return Err(Error::invalid_transition(log.status, MessageStatus::Retry));
        }

        let now = Utc::now();
        if let Some(due) = log.next_retry_at
            && due > now
        {
            return Err(Error::validation(format!(
                "message log {log_id} is not due for retry until {due}"
            )));
        }

        match self.retry.retry_one(&log, now).await? {
            RetryOutcome::Exhausted => Err(Error::validation(format!(
                "message log {log_id} has used all {} retries",
                log.retry_count
            ))),
            outcome => Ok(outcome),
        }
    }

    pub async fn stats(&self) -> Result<AlertStats> {
        let (notifications, message_logs) =
            tokio::try_join!(self.notifications.stats(), self.message_logs.stats())?;
        let false_alarm_rate = if notifications.total > 0 {
            notifications.false_alarms as f64 / notifications.total as f64
        } else {
            0.0
        };
        Ok(AlertStats {
            notifications,
            message_logs,
            false_alarm_rate,
        })
    }
}

fn ensure_owner(owner: &str, caller_id: &str, kind: &str, id: &str) -> Result<()> {
    if owner == caller_id {
        Ok(())
    } else {
        Err(Error::unauthorized(caller_id, format!("{kind} {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{SqlxMessageLogRepository, SqlxNotificationRepository};
    use crate::database::test_pool;
    use crate::domain::{
        AttemptOutcome, Channel, EmergencyKind, GeoPoint, NotificationStatus, RetryPolicy,
    };
    use crate::metrics::NoopMetrics;
    use crate::notification::channels::{ChannelSender, ChannelSet};
    use crate::notification::delivery::DeliveryExecutor;
    use crate::notification::retry::RetrySchedulerConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysOk;

    #[async_trait]
    impl ChannelSender for AlwaysOk {
        fn channel(&self) -> Channel {
            Channel::Sms
        }

        async fn send(&self, _: &str, _: &str, _: &str) -> Result<String> {
            Ok("SM1".to_string())
        }
    }

    struct Fixture {
        service: NotificationQueryService,
        notifications: Arc<SqlxNotificationRepository>,
        logs: Arc<SqlxMessageLogRepository>,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        let notifications = Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let logs = Arc::new(SqlxMessageLogRepository::new(pool, 3));
        let delivery = Arc::new(DeliveryExecutor::new(
            ChannelSet::new().with(Arc::new(AlwaysOk)),
            Arc::new(NoopMetrics),
            Duration::from_secs(5),
        ));
        let retry = Arc::new(RetryScheduler::new(
            logs.clone(),
            delivery,
            Arc::new(NoopMetrics),
            RetrySchedulerConfig {
                sweep_interval_secs: 60,
                policy: RetryPolicy {
                    retry_delay_ms: 0,
                    ..RetryPolicy::default()
                },
            },
        ));
        Fixture {
            service: NotificationQueryService::new(notifications.clone(), logs.clone(), retry),
            notifications,
            logs,
        }
    }

    async fn stored(f: &Fixture, status: NotificationStatus) -> Notification {
        let mut n = Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(40.7128, -74.0060).unwrap(),
            Utc::now(),
        );
        f.notifications.create(&n).await.unwrap();
        if status != NotificationStatus::Pending {
            n.transition(status, Utc::now()).unwrap();
            f.notifications
                .update(&n, NotificationStatus::Pending)
                .await
                .unwrap();
        }
        n
    }

    async fn failed_log(f: &Fixture, notification: &Notification) -> MessageLog {
        let log = MessageLog::from_attempt(
            &notification.id,
            &notification.user_id,
            None,
            "+15550100",
            Channel::Sms,
            "subject",
            "body",
            AttemptOutcome::Failed {
                error: "gateway 503".into(),
            },
            Utc::now() - chrono::Duration::seconds(1),
        );
        f.logs.create(&log).await.unwrap();
        log
    }

    #[tokio::test]
    async fn test_ownership_is_enforced() {
        let f = fixture().await;
        let n = stored(&f, NotificationStatus::Sent).await;

        assert_eq!(f.service.get_notification(&n.id, "u1").await.unwrap().id, n.id);
        let err = f.service.get_notification(&n.id, "u2").await.unwrap_err();
        assert!(matches!(err, Error::Authorization { .. }));
        let err = f.service.get_notification("missing", "u1").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let log = failed_log(&f, &n).await;
        assert!(f.service.get_message_log(&log.id, "u2").await.is_err());
        assert_eq!(f.service.list_message_logs(&n.id, "u1").await.unwrap().len(), 1);
        assert!(matches!(
            f.service.list_message_logs(&n.id, "u2").await,
            Err(Error::Authorization { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_and_false_alarm() {
        let f = fixture().await;

        let failed = stored(&f, NotificationStatus::Failed).await;
        let resolved = f.service.resolve(&failed.id, "u1").await.unwrap();
        assert_eq!(resolved.status, NotificationStatus::Delivered);
        assert!(resolved.resolved_at.is_some());
        assert!(f.service.resolve(&failed.id, "u1").await.is_err());

        let flagged = f.service.mark_false_alarm(&failed.id, "u1").await.unwrap();
        assert!(flagged.false_alarm);
        assert_eq!(
            flagged.resolved_at.map(|t| t.timestamp_millis()),
            resolved.resolved_at.map(|t| t.timestamp_millis())
        );

        let expired = stored(&f, NotificationStatus::Expired).await;
        assert!(matches!(
            f.service.mark_false_alarm(&expired.id, "u1").await,
            Err(Error::InvalidStateTransition { .. })
        ));

        let stats = f.service.stats().await.unwrap();
        assert_eq!(stats.notifications.total, 2);
        assert_eq!(stats.notifications.false_alarms, 1);
        assert!((stats.false_alarm_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_delivery_callback_and_operator_retry() {
        let f = fixture().await;
        let n = stored(&f, NotificationStatus::Failed).await;
        let log = failed_log(&f, &n).await;

        assert!(matches!(
            f.service
                .record_delivery_status(&log.id, MessageStatus::Retry, None)
                .await,
            Err(Error::Validation(_))
        ));

        let outcome = f.service.retry_message(&log.id).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Sent);

        assert!(matches!(
            f.service.retry_message(&log.id).await,
            Err(Error::InvalidStateTransition { .. })
        ));

        let delivered = f
            .service
            .record_delivery_status(&log.id, MessageStatus::Delivered, Some("SM1"))
            .await
            .unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);
        assert!(delivered.delivered_at.is_some());

        let stats = f.service.stats().await.unwrap();
        assert_eq!(stats.message_logs.by_status.get("DELIVERED"), Some(&1));
    }
}
