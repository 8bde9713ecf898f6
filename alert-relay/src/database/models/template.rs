//! Message template row model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::now_ms;

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct MessageTemplateDbModel {
    pub id: String,
    pub name: String,
    pub subject: String,
    /// Email body.
    pub body: String,
    /// Short body for SMS; falls back to `body` when absent.
    pub sms_body: Option<String>,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MessageTemplateDbModel {
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        sms_body: Option<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            subject: subject.into(),
            body: body.into(),
            sms_body,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
