use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use wagate_common::models::{Conversation, ConversationMessage, Direction};
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Create or refresh the conversation for an inbound message and
    /// return the current row (including any assigned human agent).
    async fn upsert_inbound<'a>(
        &self,
        user_id: Uuid,
        session_id: &str,
        customer_phone: &str,
        customer_name: Option<&'a str>,
        at: DateTime<Utc>,
    ) -> Result<Conversation, Error>;
    async fn append_message(
        &self,
        conversation_id: i64,
        direction: Direction,
        content: &str,
    ) -> Result<(), Error>;
    /// The last `limit` lines in chronological order.
    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<ConversationMessage>, Error>;
}

pub struct PostgresConversationRepository {
    pool: Pool<Postgres>,
}

impl PostgresConversationRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationRepository for PostgresConversationRepository {
    async fn upsert_inbound<'a>(
        &self,
        user_id: Uuid,
        session_id: &str,
        customer_phone: &str,
        customer_name: Option<&'a str>,
        at: DateTime<Utc>,
    ) -> Result<Conversation, Error> {
        let row = sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (
                user_id, session_id, customer_phone, customer_name, last_message_at
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id, customer_phone) DO UPDATE
            SET customer_name = COALESCE(conversations.customer_name, EXCLUDED.customer_name),
                last_message_at = EXCLUDED.last_message_at,
                updated_at = NOW()
            RETURNING id, user_id, session_id, customer_phone, customer_name,
                      human_agent_id, last_message_at, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(customer_phone)
        .bind(customer_name)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        direction: Direction,
        content: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO conversation_messages (conversation_id, direction, content)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(conversation_id)
        .bind(direction)
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: i64,
        limit: i64,
    ) -> Result<Vec<ConversationMessage>, Error> {
        let rows = sqlx::query_as::<_, ConversationMessage>(
            r#"
            SELECT id, conversation_id, direction, content, created_at
            FROM (
                SELECT id, conversation_id, direction, content, created_at
                FROM conversation_messages
                WHERE conversation_id = $1
                ORDER BY id DESC
                LIMIT $2
            ) AS recent
            ORDER BY id ASC
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
