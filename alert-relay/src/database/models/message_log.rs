//! Message log row model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::parse_column;
use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms, opt_ms_to_datetime};
use crate::domain::MessageLog;
use crate::{Error, Result};

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MessageLogDbModel {
    pub id: String,
    pub notification_id: String,
    pub user_id: String,
    pub contact_id: Option<String>,
    pub destination: String,
    pub channel: String,
    pub subject: String,
    pub content: String,
    pub status: String,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub delivery_id: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub next_retry_at: Option<i64>,
}

impl From<&MessageLog> for MessageLogDbModel {
    fn from(log: &MessageLog) -> Self {
        Self {
            id: log.id.clone(),
            notification_id: log.notification_id.clone(),
            user_id: log.user_id.clone(),
            contact_id: log.contact_id.clone(),
            destination: log.destination.clone(),
            channel: log.channel.to_string(),
            subject: log.subject.clone(),
            content: log.content.clone(),
            status: log.status.to_string(),
            created_at: datetime_to_ms(log.created_at),
            sent_at: opt_datetime_to_ms(log.sent_at),
            delivered_at: opt_datetime_to_ms(log.delivered_at),
            delivery_id: log.delivery_id.clone(),
            error_message: log.error_message.clone(),
            retry_count: i64::from(log.retry_count),
            next_retry_at: opt_datetime_to_ms(log.next_retry_at),
        }
    }
}

impl TryFrom<MessageLogDbModel> for MessageLog {
    type Error = Error;

    fn try_from(row: MessageLogDbModel) -> Result<Self> {
        Ok(Self {
            channel: parse_column("channel", &row.channel)?,
            status: parse_column("status", &row.status)?,
            created_at: ms_to_datetime(row.created_at),
            sent_at: opt_ms_to_datetime(row.sent_at),
            delivered_at: opt_ms_to_datetime(row.delivered_at),
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            next_retry_at: opt_ms_to_datetime(row.next_retry_at),
            id: row.id,
            notification_id: row.notification_id,
            user_id: row.user_id,
            contact_id: row.contact_id,
            destination: row.destination,
            subject: row.subject,
            content: row.content,
            delivery_id: row.delivery_id,
            error_message: row.error_message,
        })
    }
}
