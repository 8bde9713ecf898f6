//! Emergency notification row model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::parse_column;
use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::domain::{ContactNotification, GeoPoint, Notification};
use crate::{Error, Result};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub message: String,
    pub reason: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub location: Option<String>,
    pub audio_ref: Option<String>,
    pub status: String,
    pub status_reason: Option<String>,
    /// JSON array of contact plan entries.
    pub contacts: String,
    pub contacts_notified: i64,
    pub duplicate: bool,
    pub escalated: bool,
    pub false_alarm: bool,
    pub triggered_at: i64,
    pub expires_at: i64,
    pub resolved_at: Option<i64>,
    pub updated_at: i64,
}

impl TryFrom<&Notification> for NotificationDbModel {
    type Error = Error;

    fn try_from(n: &Notification) -> Result<Self> {
        Ok(Self {
            id: n.id.clone(),
            user_id: n.user_id.clone(),
            kind: n.kind.to_string(),
            message: n.message.clone(),
            reason: n.reason.clone(),
            latitude: n.position.latitude(),
            longitude: n.position.longitude(),
            location: n.location.clone(),
            audio_ref: n.audio_ref.clone(),
            status: n.status.to_string(),
            status_reason: n.status_reason.clone(),
            contacts: serde_json::to_string(&n.contacts)?,
            contacts_notified: i64::from(n.contacts_notified),
            duplicate: n.duplicate,
            escalated: n.escalated,
            false_alarm: n.false_alarm,
            triggered_at: datetime_to_ms(n.triggered_at),
            expires_at: datetime_to_ms(n.expires_at),
            resolved_at: opt_datetime_to_ms(n.resolved_at),
            updated_at: datetime_to_ms(n.updated_at),
        })
    }
}

impl TryFrom<NotificationDbModel> for Notification {
    type Error = Error;

    fn try_from(row: NotificationDbModel) -> Result<Self> {
        let contacts: Vec<ContactNotification> = serde_json::from_str(&row.contacts)?;
        Ok(Self {
            kind: parse_column("kind", &row.kind)?,
            status: parse_column("status", &row.status)?,
            position: GeoPoint::new(row.latitude, row.longitude)
                .map_err(|e| Error::Database(format!("stored position invalid: {e}")))?,
            contacts,
            contacts_notified: u32::try_from(row.contacts_notified).unwrap_or_default(),
            triggered_at: ms_to_datetime(row.triggered_at),
            expires_at: ms_to_datetime(row.expires_at),
            resolved_at: opt_ms_to_datetime(row.resolved_at),
            updated_at: ms_to_datetime(row.updated_at),
            id: row.id,
            user_id: row.user_id,
            message: row.message,
            reason: row.reason,
            location: row.location,
            audio_ref: row.audio_ref,
            status_reason: row.status_reason,
            duplicate: row.duplicate,
            escalated: row.escalated,
            false_alarm: row.false_alarm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EmergencyKind, NotificationStatus};
    use chrono::Utc;

    #[test]
    fn test_corrupt_kind_is_reported() {
        let n = Notification::new(
            "u1",
            EmergencyKind::Manual,
            "help",
            GeoPoint::new(1.0, 2.0).unwrap(),
            Utc::now(),
        );
        let mut row = NotificationDbModel::try_from(&n).unwrap();
        assert_eq!(row.status, NotificationStatus::Pending.to_string());
        row.kind = "EARTHQUAKE".to_string();
        let err = Notification::try_from(row).unwrap_err();
        assert!(err.to_string().contains("EARTHQUAKE"));
    }
}
