//! Message template repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::MessageTemplateDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn find_active(&self, name: &str) -> Result<Option<MessageTemplateDbModel>>;
    async fn list(&self) -> Result<Vec<MessageTemplateDbModel>>;
    async fn count_active(&self) -> Result<i64>;
    /// Insert or replace the template with the same name.
    async fn upsert(&self, template: &MessageTemplateDbModel) -> Result<()>;
    async fn set_active(&self, name: &str, active: bool) -> Result<bool>;
}

pub struct SqlxTemplateRepository {
    pool: SqlitePool,
}

impl SqlxTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for SqlxTemplateRepository {
    async fn find_active(&self, name: &str) -> Result<Option<MessageTemplateDbModel>> {
        let template = sqlx::query_as::<_, MessageTemplateDbModel>(
            "SELECT * FROM message_template WHERE name = ? AND active = 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(template)
    }

    async fn list(&self) -> Result<Vec<MessageTemplateDbModel>> {
        let templates = sqlx::query_as::<_, MessageTemplateDbModel>(
            "SELECT * FROM message_template ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(templates)
    }

    async fn count_active(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM message_template WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn upsert(&self, template: &MessageTemplateDbModel) -> Result<()> {
        retry_on_sqlite_busy("upsert_template", || async {
            sqlx::query(
                r#"
                INSERT INTO message_template (
                    id, name, subject, body, sms_body, active, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    subject = excluded.subject,
                    body = excluded.body,
                    sms_body = excluded.sms_body,
                    active = excluded.active,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&template.id)
            .bind(&template.name)
            .bind(&template.subject)
            .bind(&template.body)
            .bind(&template.sms_body)
            .bind(template.active)
            .bind(template.created_at)
            .bind(template.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_active(&self, name: &str, active: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE message_template SET active = ?, updated_at = ? WHERE name = ?",
        )
        .bind(active)
        .bind(now_ms())
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
