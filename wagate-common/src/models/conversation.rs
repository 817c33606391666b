use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::message::Direction;

/// Pairs a session with a customer phone for human-agent routing. The core
/// creates or updates this row on each inbound message; a non-null
/// `human_agent_id` means auto-reply must stand down.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Conversation {
    pub id: i64,
    pub user_id: Uuid,
    pub session_id: String,
    pub customer_phone: String,
    pub customer_name: Option<String>,
    pub human_agent_id: Option<Uuid>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of a conversation, used as the AI responder's history window.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ConversationMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub direction: Direction,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
