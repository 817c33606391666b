use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use wagate_common::models::{Message, MessageStatus};
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// At-most-once insert keyed on the external `message_id`. Returns
    /// `None` when a row with the same id already exists.
    async fn insert_incoming(&self, message: &Message) -> Result<Option<Message>, Error>;
    async fn insert_outgoing(&self, message: &Message) -> Result<Message, Error>;
    async fn exists(&self, message_id: &str) -> Result<bool, Error>;
    /// Monotonic status advance; stamps the matching timestamp column.
    /// Returns false when the transition was refused (regression or
    /// terminal row).
    async fn advance_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, Error>;
    async fn mark_failed(&self, message_id: &str) -> Result<(), Error>;
    /// Swap a provisional outgoing id for the provider-assigned one once
    /// the send receipt arrives.
    async fn set_message_id(&self, id: i64, message_id: &str) -> Result<(), Error>;
}

pub struct PostgresMessageRepository {
    pool: Pool<Postgres>,
}

impl PostgresMessageRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const MESSAGE_COLUMNS: &str = r#"
    id, session_id, message_id, direction, message_type, from_number,
    to_number, push_name, content, media, status, is_auto_reply,
    auto_reply_source, reply_context, sent_at, delivered_at, read_at,
    created_at
"#;

async fn insert(
    pool: &Pool<Postgres>,
    message: &Message,
    on_conflict_do_nothing: bool,
) -> Result<Option<Message>, Error> {
    let conflict_clause = if on_conflict_do_nothing {
        "ON CONFLICT (message_id) DO NOTHING"
    } else {
        ""
    };
    let row = sqlx::query_as::<_, Message>(&format!(
        r#"
        INSERT INTO whatsapp_messages (
            session_id, message_id, direction, message_type, from_number,
            to_number, push_name, content, media, status, is_auto_reply,
            auto_reply_source, reply_context, sent_at, delivered_at, read_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        {conflict_clause}
        RETURNING {MESSAGE_COLUMNS}
        "#
    ))
    .bind(&message.session_id)
    .bind(&message.message_id)
    .bind(message.direction)
    .bind(message.message_type)
    .bind(&message.from_number)
    .bind(&message.to_number)
    .bind(&message.push_name)
    .bind(&message.content)
    .bind(&message.media)
    .bind(message.status)
    .bind(message.is_auto_reply)
    .bind(message.auto_reply_source)
    .bind(&message.reply_context)
    .bind(message.sent_at)
    .bind(message.delivered_at)
    .bind(message.read_at)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    async fn insert_incoming(&self, message: &Message) -> Result<Option<Message>, Error> {
        insert(&self.pool, message, true).await
    }

    async fn insert_outgoing(&self, message: &Message) -> Result<Message, Error> {
        insert(&self.pool, message, false)
            .await?
            .ok_or_else(|| Error::Internal("outgoing insert returned no row".to_string()))
    }

    async fn exists(&self, message_id: &str) -> Result<bool, Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM whatsapp_messages WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn advance_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        // The rank CASEs enforce the pending -> sent -> delivered -> read
        // ladder in one statement; failed rows never move.
        let result = sqlx::query(
            r#"
            UPDATE whatsapp_messages
            SET status = $2::text,
                sent_at = CASE WHEN $2 = 'sent' THEN COALESCE(sent_at, $3) ELSE sent_at END,
                delivered_at = CASE WHEN $2 = 'delivered' THEN COALESCE(delivered_at, $3) ELSE delivered_at END,
                read_at = CASE WHEN $2 = 'read' THEN COALESCE(read_at, $3) ELSE read_at END
            WHERE message_id = $1
              AND status <> 'failed'
              AND (CASE status
                     WHEN 'pending' THEN 0 WHEN 'sent' THEN 1
                     WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 ELSE 4 END)
                < (CASE $2
                     WHEN 'pending' THEN 0 WHEN 'sent' THEN 1
                     WHEN 'delivered' THEN 2 WHEN 'read' THEN 3 ELSE 4 END)
            "#,
        )
        .bind(message_id)
        .bind(status.to_string())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, message_id: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE whatsapp_messages
            SET status = 'failed'
            WHERE message_id = $1 AND status <> 'failed'
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_message_id(&self, id: i64, message_id: &str) -> Result<(), Error> {
        sqlx::query("UPDATE whatsapp_messages SET message_id = $2 WHERE id = $1")
            .bind(id)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    Error::Integrity(format!("message id '{}' already recorded", message_id))
                }
                _ => Error::Database(e),
            })?;
        Ok(())
    }
}
