//! Emergency notification repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::database::models::NotificationDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{Notification, NotificationStatus};
use crate::{Error, Result};

/// Aggregate notification counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub escalated: i64,
    pub duplicates: i64,
    pub false_alarms: i64,
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn create(&self, notification: &Notification) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Notification>;
    /// Persist `notification` only if the stored status still equals `expected`.
    async fn update(&self, notification: &Notification, expected: NotificationStatus)
    -> Result<()>;
    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>>;
    /// Count the user's notifications triggered in `[since, until]`.
    async fn count_triggered_between(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64>;
    /// Move unresolved notifications past their expiry to EXPIRED.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64>;
    async fn stats(&self) -> Result<NotificationStats>;
}

pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn create(&self, notification: &Notification) -> Result<()> {
        let row = NotificationDbModel::try_from(notification)?;
        retry_on_sqlite_busy("create_notification", || async {
            sqlx::query(
                r#"
                INSERT INTO emergency_notification (
                    id, user_id, kind, message, reason, latitude, longitude, location,
                    audio_ref, status, status_reason, contacts, contacts_notified,
                    duplicate, escalated, false_alarm, triggered_at, expires_at,
                    resolved_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.id)
            .bind(&row.user_id)
            .bind(&row.kind)
            .bind(&row.message)
            .bind(&row.reason)
            .bind(row.latitude)
            .bind(row.longitude)
            .bind(&row.location)
            .bind(&row.audio_ref)
            .bind(&row.status)
            .bind(&row.status_reason)
            .bind(&row.contacts)
            .bind(row.contacts_notified)
            .bind(row.duplicate)
            .bind(row.escalated)
            .bind(row.false_alarm)
            .bind(row.triggered_at)
            .bind(row.expires_at)
            .bind(row.resolved_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Notification> {
        sqlx::query_as::<_, NotificationDbModel>(
            "SELECT * FROM emergency_notification WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("Notification", id))?
        .try_into()
    }

    async fn update(
        &self,
        notification: &Notification,
        expected: NotificationStatus,
    ) -> Result<()> {
        let row = NotificationDbModel::try_from(notification)?;
        let expected = expected.to_string();
        let affected = retry_on_sqlite_busy("update_notification", || async {
            let result = sqlx::query(
                r#"
                UPDATE emergency_notification SET
                    status = ?,
                    status_reason = ?,
                    contacts = ?,
                    contacts_notified = ?,
                    duplicate = ?,
                    escalated = ?,
                    false_alarm = ?,
                    resolved_at = ?,
                    updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(&row.status)
            .bind(&row.status_reason)
            .bind(&row.contacts)
            .bind(row.contacts_notified)
            .bind(row.duplicate)
            .bind(row.escalated)
            .bind(row.false_alarm)
            .bind(row.resolved_at)
            .bind(row.updated_at)
            .bind(&row.id)
            .bind(&expected)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            // Either gone or changed underneath us.
            let current = self.get(&notification.id).await?;
            return Err(Error::invalid_transition(
                current.status,
                notification.status,
            ));
        }
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationDbModel>(
            r#"
            SELECT * FROM emergency_notification
            WHERE user_id = ?
            ORDER BY triggered_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn count_triggered_between(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM emergency_notification
            WHERE user_id = ? AND triggered_at >= ? AND triggered_at <= ?
            "#,
        )
        .bind(user_id)
        .bind(datetime_to_ms(since))
        .bind(datetime_to_ms(until))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let now_ms = datetime_to_ms(now);
        retry_on_sqlite_busy("expire_overdue_notifications", || async {
            let result = sqlx::query(
                r#"
                UPDATE emergency_notification
                SET status = 'EXPIRED', updated_at = ?
                WHERE status IN ('PENDING', 'SENT', 'FAILED') AND expires_at <= ?
                "#,
            )
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn stats(&self) -> Result<NotificationStats> {
        let (total, escalated, duplicates, false_alarms): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(escalated), 0),
                COALESCE(SUM(duplicate), 0),
                COALESCE(SUM(false_alarm), 0)
            FROM emergency_notification
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM emergency_notification GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(NotificationStats {
            total,
            by_status: by_status.into_iter().collect(),
            escalated,
            duplicates,
            false_alarms,
        })
    }
}
