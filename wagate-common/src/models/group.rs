use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Joined chat group, unique per (user, session, group_jid).
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Group {
    pub id: i64,
    pub user_id: Uuid,
    pub session_id: String,
    pub group_jid: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub owner_jid: Option<String>,
    pub participant_count: i32,
    pub admin_count: i32,
    pub is_announce: bool,
    pub is_locked: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Group member, unique per (group, participant_jid). `phone_number` is
/// null when the participant is only known by a LID the transport could
/// not resolve.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct GroupMember {
    pub id: i64,
    pub group_id: i64,
    pub participant_jid: String,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub push_name: Option<String>,
    pub is_admin: bool,
    pub is_super_admin: bool,
    pub is_lid_format: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
