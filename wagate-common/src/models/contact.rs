use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Address-book entry, unique per (user, session, phone). Upserts merge by
/// preferring non-null incoming values, except `display_name`: a value a
/// human assigned is never overwritten by a scraped push name.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Contact {
    pub id: i64,
    pub user_id: Uuid,
    pub session_id: String,
    pub phone_number: String,
    pub display_name: Option<String>,
    pub push_name: Option<String>,
    pub is_business: bool,
    pub is_group: bool,
    pub metadata: Value,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// A bare entry as produced by the scraper or the inbound auto-saver.
    pub fn new(user_id: Uuid, session_id: &str, phone_number: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            session_id: session_id.to_string(),
            phone_number: phone_number.to_string(),
            display_name: None,
            push_name: None,
            is_business: false,
            is_group: false,
            metadata: Value::Null,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
