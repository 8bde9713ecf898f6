//! Message log repository: the per-attempt delivery state machine.
//!
//! All status changes are compare-and-set on the status that was read, so a
//! concurrent writer can never silently overwrite a transition. The retry claim
//! is a single conditional `UPDATE` that also takes a lease: a RETRY row stays
//! unclaimable until its lease lapses, however short the retry delay.
//!
//! Entries whose notification is expired, resolved or a false alarm are never
//! offered for retry.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::database::models::MessageLogDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{AttemptOutcome, MessageLog, MessageStatus};
use crate::{Error, Result};

/// Aggregate message log counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageLogStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_channel: BTreeMap<String, i64>,
    /// Mean of `delivered_at - sent_at` over DELIVERED entries.
    pub avg_delivery_ms: Option<f64>,
}

#[async_trait]
pub trait MessageLogRepository: Send + Sync {
    async fn create(&self, log: &MessageLog) -> Result<String>;
    async fn get(&self, id: &str) -> Result<MessageLog>;
    /// Apply a delivery-status update (provider callback or operator action).
    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        delivery_id: Option<&str>,
    ) -> Result<MessageLog>;
    /// FAILED/RETRY entries whose retry is due and which are under the bound.
    async fn find_ready_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<MessageLog>>;
    /// Atomically claim an entry for retry until `lease_until`. Returns `false`
    /// if another caller holds the claim or the entry is no longer eligible.
    async fn mark_retrying(
        &self,
        id: &str,
        now: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;
    /// Record the result of a re-attempt on a claimed (RETRY) entry.
    async fn record_attempt_outcome(
        &self,
        id: &str,
        outcome: &AttemptOutcome,
        at: DateTime<Utc>,
    ) -> Result<MessageLog>;
    async fn mark_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<MessageLog>;
    async fn list_by_notification(&self, notification_id: &str) -> Result<Vec<MessageLog>>;
    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<MessageLog>>;
    async fn list_by_status(&self, status: MessageStatus, limit: i64) -> Result<Vec<MessageLog>>;
    /// Purge entries created before `cutoff`. Statuses are never rewritten.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
    async fn stats(&self) -> Result<MessageLogStats>;
    fn max_retries(&self) -> u32;
}

pub struct SqlxMessageLogRepository {
    pool: SqlitePool,
    max_retries: u32,
}

impl SqlxMessageLogRepository {
    pub fn new(pool: SqlitePool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    /// Write the mutable columns of `next` if the stored status is still `expected`.
    async fn compare_and_set(&self, next: &MessageLog, expected: MessageStatus) -> Result<()> {
        let row = MessageLogDbModel::from(next);
        let expected = expected.to_string();
        let affected = retry_on_sqlite_busy("update_message_log", || async {
            let result = sqlx::query(
                r#"
                UPDATE message_log SET
                    status = ?,
                    sent_at = ?,
                    delivered_at = ?,
                    delivery_id = ?,
                    error_message = ?,
                    next_retry_at = ?,
                    claimed_until = NULL
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(&row.status)
            .bind(row.sent_at)
            .bind(row.delivered_at)
            .bind(&row.delivery_id)
            .bind(&row.error_message)
            .bind(row.next_retry_at)
            .bind(&row.id)
            .bind(&expected)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            let current = self.get(&next.id).await?;
            return Err(Error::invalid_transition(current.status, next.status));
        }
        Ok(())
    }

    /// Backoff to keep after a failure: cleared once the bound is reached.
    fn failure_next_retry(
        &self,
        log: &MessageLog,
        fallback: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if log.retry_count >= self.max_retries {
            None
        } else {
            Some(log.next_retry_at.unwrap_or(fallback))
        }
    }
}

#[async_trait]
impl MessageLogRepository for SqlxMessageLogRepository {
    async fn create(&self, log: &MessageLog) -> Result<String> {
        let row = MessageLogDbModel::from(log);
        retry_on_sqlite_busy("create_message_log", || async {
            sqlx::query(
                r#"
                INSERT INTO message_log (
                    id, notification_id, user_id, contact_id, destination, channel,
                    subject, content, status, created_at, sent_at, delivered_at,
                    delivery_id, error_message, retry_count, next_retry_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.notification_id)
            .bind(&row.user_id)
            .bind(&row.contact_id)
            .bind(&row.destination)
            .bind(&row.channel)
            .bind(&row.subject)
            .bind(&row.content)
            .bind(&row.status)
            .bind(row.created_at)
            .bind(row.sent_at)
            .bind(row.delivered_at)
            .bind(&row.delivery_id)
            .bind(&row.error_message)
            .bind(row.retry_count)
            .bind(row.next_retry_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        Ok(row.id)
    }

    async fn get(&self, id: &str) -> Result<MessageLog> {
        sqlx::query_as::<_, MessageLogDbModel>("SELECT * FROM message_log WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("MessageLog", id))?
            .try_into()
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        delivery_id: Option<&str>,
    ) -> Result<MessageLog> {
        if status == MessageStatus::Retry {
            return Err(Error::validation(
                "RETRY is only reachable through a retry claim",
            ));
        }

        let current = self.get(id).await?;
        current.status.ensure_transition(status)?;

        let now = Utc::now();
        let mut next = current.clone();
        next.status = status;
        if let Some(delivery_id) = delivery_id {
            next.delivery_id = Some(delivery_id.to_string());
        }
        match status {
            MessageStatus::Delivered => {
                next.delivered_at = Some(now);
                next.next_retry_at = None;
            }
            MessageStatus::Sent => {
                next.sent_at = Some(now);
                next.next_retry_at = None;
            }
            MessageStatus::Failed => {
                next.next_retry_at = self.failure_next_retry(&current, now);
            }
            MessageStatus::Pending | MessageStatus::Retry => {}
        }

        self.compare_and_set(&next, current.status).await?;
        Ok(next)
    }

    async fn find_ready_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLogDbModel>(
            r#"
            SELECT * FROM message_log
            WHERE (status = 'FAILED'
                   OR (status = 'RETRY' AND (claimed_until IS NULL OR claimed_until <= ?1)))
              AND retry_count < ?2
              AND (next_retry_at IS NULL OR next_retry_at <= ?1)
              AND NOT EXISTS (
                  SELECT 1 FROM emergency_notification n
                  WHERE n.id = message_log.notification_id
                    AND (n.status = 'EXPIRED' OR n.false_alarm = 1 OR n.resolved_at IS NOT NULL)
              )
            ORDER BY created_at ASC
            "#,
        )
        .bind(datetime_to_ms(now))
        .bind(i64::from(self.max_retries))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageLog::try_from).collect()
    }

    async fn mark_retrying(
        &self,
        id: &str,
        now: DateTime<Utc>,
        next_retry_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let max = i64::from(self.max_retries);
        let now_ms = datetime_to_ms(now);
        let next_ms = datetime_to_ms(next_retry_at);
        let lease_ms = datetime_to_ms(lease_until);
        let affected = retry_on_sqlite_busy("mark_retrying", || async {
            let result = sqlx::query(
                r#"
                UPDATE message_log SET
                    status = 'RETRY',
                    retry_count = retry_count + 1,
                    next_retry_at = ?1,
                    claimed_until = ?2
                WHERE id = ?3
                  AND (status = 'FAILED'
                       OR (status = 'RETRY' AND (claimed_until IS NULL OR claimed_until <= ?4)))
                  AND retry_count < ?5
                  AND (next_retry_at IS NULL OR next_retry_at <= ?4)
                  AND NOT EXISTS (
                      SELECT 1 FROM emergency_notification n
                      WHERE n.id = message_log.notification_id
                        AND (n.status = 'EXPIRED' OR n.false_alarm = 1 OR n.resolved_at IS NOT NULL)
                  )
                "#,
            )
            .bind(next_ms)
            .bind(lease_ms)
            .bind(id)
            .bind(now_ms)
            .bind(max)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;
        Ok(affected == 1)
    }

    async fn record_attempt_outcome(
        &self,
        id: &str,
        outcome: &AttemptOutcome,
        at: DateTime<Utc>,
    ) -> Result<MessageLog> {
        let current = self.get(id).await?;
        let mut next = current.clone();
        match outcome {
            AttemptOutcome::Sent { delivery_id } => {
                current.status.ensure_transition(MessageStatus::Sent)?;
                next.status = MessageStatus::Sent;
                next.sent_at = Some(at);
                next.delivery_id = Some(delivery_id.clone());
                next.error_message = None;
                next.next_retry_at = None;
            }
            AttemptOutcome::Failed { error } => {
                current.status.ensure_transition(MessageStatus::Failed)?;
                next.status = MessageStatus::Failed;
                next.error_message = Some(error.clone());
                next.next_retry_at = self.failure_next_retry(&current, at);
            }
        }
        self.compare_and_set(&next, current.status).await?;
        Ok(next)
    }

    async fn mark_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<MessageLog> {
        let current = self.get(id).await?;
        current.status.ensure_transition(MessageStatus::Failed)?;
        let mut next = current.clone();
        next.status = MessageStatus::Failed;
        next.error_message = Some(error.to_string());
        next.next_retry_at = self.failure_next_retry(&current, at);
        self.compare_and_set(&next, current.status).await?;
        Ok(next)
    }

    async fn list_by_notification(&self, notification_id: &str) -> Result<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLogDbModel>(
            "SELECT * FROM message_log WHERE notification_id = ? ORDER BY created_at ASC",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageLog::try_from).collect()
    }

    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLogDbModel>(
            "SELECT * FROM message_log WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageLog::try_from).collect()
    }

    async fn list_by_status(&self, status: MessageStatus, limit: i64) -> Result<Vec<MessageLog>> {
        let rows = sqlx::query_as::<_, MessageLogDbModel>(
            "SELECT * FROM message_log WHERE status = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(status.as_ref())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MessageLog::try_from).collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff_ms = datetime_to_ms(cutoff);
        retry_on_sqlite_busy("delete_old_message_logs", || async {
            let result = sqlx::query("DELETE FROM message_log WHERE created_at < ?")
                .bind(cutoff_ms)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn stats(&self) -> Result<MessageLogStats> {
        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM message_log GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let by_channel: Vec<(String, i64)> =
            sqlx::query_as("SELECT channel, COUNT(*) FROM message_log GROUP BY channel")
                .fetch_all(&self.pool)
                .await?;
        let (avg_delivery_ms,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT AVG(delivered_at - sent_at) FROM message_log
            WHERE status = 'DELIVERED' AND delivered_at IS NOT NULL AND sent_at IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MessageLogStats {
            total: by_status.iter().map(|(_, n)| n).sum(),
            by_status: by_status.into_iter().collect(),
            by_channel: by_channel.into_iter().collect(),
            avg_delivery_ms,
        })
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{NotificationRepository, SqlxNotificationRepository};
    use crate::database::test_pool;
    use crate::domain::{Channel, EmergencyKind, GeoPoint, Notification, NotificationStatus};
    use chrono::Duration;

    async fn setup() -> (SqlxMessageLogRepository, String) {
        let pool = test_pool().await;
        let notification = Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(0.0, 0.0).unwrap(),
            Utc::now(),
        );
        SqlxNotificationRepository::new(pool.clone())
            .create(&notification)
            .await
            .unwrap();
        (SqlxMessageLogRepository::new(pool, 3), notification.id)
    }

    fn failed_log(notification_id: &str, at: DateTime<Utc>) -> MessageLog {
        MessageLog::from_attempt(
            notification_id,
            "u1",
            Some("c1".to_string()),
            "a@x.com",
            Channel::Email,
            "subject",
            "body",
            AttemptOutcome::Failed {
                error: "smtp down".to_string(),
            },
            at,
        )
    }

    #[tokio::test]
    async fn test_delivered_at_only_set_on_delivered() {
        let (repo, nid) = setup().await;
        let log = MessageLog::from_attempt(
            &nid,
            "u1",
            None,
            "+15550001",
            Channel::Sms,
            "",
            "body",
            AttemptOutcome::Sent {
                delivery_id: "SM1".to_string(),
            },
            Utc::now(),
        );
        let id = repo.create(&log).await.unwrap();
        assert!(repo.get(&id).await.unwrap().delivered_at.is_none());

        let delivered = repo
            .update_status(&id, MessageStatus::Delivered, None)
            .await
            .unwrap();
        assert!(delivered.delivered_at.is_some());
        assert_eq!(delivered.delivery_id.as_deref(), Some("SM1"));

        let err = repo
            .update_status(&id, MessageStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_retry_claim_lifecycle_is_bounded() {
        let (repo, nid) = setup().await;
        let start = Utc::now();
        let id = repo.create(&failed_log(&nid, start)).await.unwrap();

        let mut now = start;
        for attempt in 1..=3u32 {
            let ready = repo.find_ready_for_retry(now).await.unwrap();
            assert_eq!(ready.len(), 1, "attempt {attempt}");

            let next = now + Duration::minutes(5);
            let lease = now + Duration::minutes(1);
            assert!(repo.mark_retrying(&id, now, next, lease).await.unwrap());
            // Already claimed for this window.
            assert!(!repo.mark_retrying(&id, now, next, lease).await.unwrap());
            assert!(repo.find_ready_for_retry(now).await.unwrap().is_empty());

            let log = repo
                .record_attempt_outcome(
                    &id,
                    &AttemptOutcome::Failed {
                        error: "still down".to_string(),
                    },
                    now,
                )
                .await
                .unwrap();
            assert_eq!(log.retry_count, attempt);
            assert_eq!(log.status, MessageStatus::Failed);
            assert!(repo.get(&id).await.unwrap().sent_at.is_none());
            now = next;
        }

        let exhausted = repo.get(&id).await.unwrap();
        assert_eq!(exhausted.retry_count, 3);
        assert!(exhausted.next_retry_at.is_none());
        let far_future = now + Duration::days(365);
        assert!(repo.find_ready_for_retry(far_future).await.unwrap().is_empty());
        assert!(
            !repo
                .mark_retrying(&id, far_future, far_future, far_future)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_successful_retry_moves_to_sent() {
        let (repo, nid) = setup().await;
        let now = Utc::now();
        let id = repo.create(&failed_log(&nid, now)).await.unwrap();

        let lease = now + Duration::minutes(1);
        assert!(repo.mark_retrying(&id, now, now, lease).await.unwrap());
        let log = repo
            .record_attempt_outcome(
                &id,
                &AttemptOutcome::Sent {
                    delivery_id: "msg-2".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(log.status, MessageStatus::Sent);
        assert_eq!(log.retry_count, 1);
        assert!(log.error_message.is_none());
        assert_eq!(
            repo.get(&id).await.unwrap().sent_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
        assert!(repo.find_ready_for_retry(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_lease_blocks_reclaim_until_it_lapses() {
        let (repo, nid) = setup().await;
        let now = Utc::now();
        let id = repo.create(&failed_log(&nid, now)).await.unwrap();

        // Zero retry delay: only the lease keeps the in-flight entry exclusive.
        let lease = now + Duration::seconds(30);
        assert!(repo.mark_retrying(&id, now, now, lease).await.unwrap());
        let later = now + Duration::seconds(1);
        assert!(repo.find_ready_for_retry(later).await.unwrap().is_empty());
        assert!(!repo.mark_retrying(&id, later, later, later).await.unwrap());

        // A claimer that never reported back loses the entry once the lease ends.
        let lapsed = now + Duration::minutes(1);
        assert_eq!(repo.find_ready_for_retry(lapsed).await.unwrap().len(), 1);
        assert!(
            repo.mark_retrying(&id, lapsed, lapsed, lapsed + Duration::seconds(30))
                .await
                .unwrap()
        );
        assert_eq!(repo.get(&id).await.unwrap().retry_count, 2);
    }

    #[tokio::test]
    async fn test_inert_notifications_are_not_retried() {
        let pool = test_pool().await;
        let notifications = SqlxNotificationRepository::new(pool.clone());
        let repo = SqlxMessageLogRepository::new(pool, 3);
        let now = Utc::now();

        let mut flagged = Vec::new();
        for status in [NotificationStatus::Expired, NotificationStatus::Delivered] {
            let mut n = Notification::new(
                "u1",
                EmergencyKind::Manual,
                "help",
                GeoPoint::new(0.0, 0.0).unwrap(),
                now,
            );
            notifications.create(&n).await.unwrap();
            n.transition(status, now).unwrap();
            if status == NotificationStatus::Delivered {
                n.mark_false_alarm(now).unwrap();
            }
            notifications
                .update(&n, NotificationStatus::Pending)
                .await
                .unwrap();
            flagged.push(repo.create(&failed_log(&n.id, now)).await.unwrap());
        }

        assert!(repo.find_ready_for_retry(now).await.unwrap().is_empty());
        let lease = now + Duration::minutes(1);
        for id in &flagged {
            assert!(!repo.mark_retrying(id, now, now, lease).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_retry_cannot_be_set_directly() {
        let (repo, nid) = setup().await;
        let id = repo.create(&failed_log(&nid, Utc::now())).await.unwrap();
        let err = repo
            .update_status(&id, MessageStatus::Retry, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_listing_purge_and_stats() {
        let (repo, nid) = setup().await;
        let now = Utc::now();
        let old = failed_log(&nid, now - Duration::days(31));
        let fresh = MessageLog::from_attempt(
            &nid,
            "u1",
            None,
            "b@x.com",
            Channel::Email,
            "s",
            "b",
            AttemptOutcome::Sent {
                delivery_id: "d1".to_string(),
            },
            now - Duration::seconds(10),
        );
        repo.create(&old).await.unwrap();
        let fresh_id = repo.create(&fresh).await.unwrap();
        repo.update_status(&fresh_id, MessageStatus::Delivered, None)
            .await
            .unwrap();

        assert_eq!(repo.list_by_notification(&nid).await.unwrap().len(), 2);
        assert_eq!(repo.list_by_user("u1", 10).await.unwrap().len(), 2);
        assert_eq!(
            repo.list_by_status(MessageStatus::Failed, 10)
                .await
                .unwrap()
                .len(),
            1
        );

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_channel.get("EMAIL"), Some(&2));
        let avg = stats.avg_delivery_ms.unwrap();
        assert!(avg >= 10_000.0, "avg was {avg}");

        let purged = repo
            .delete_older_than(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(repo.get(&old.id).await.is_err());
        assert_eq!(
            repo.get(&fresh_id).await.unwrap().status,
            MessageStatus::Delivered
        );
    }
}
