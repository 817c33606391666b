use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

/// User-managed keyword rule. Evaluation is case-insensitive except for
/// regex rules, ordered by descending priority then ascending id.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct AutoReplyRule {
    pub id: i64,
    pub session_id: String,
    pub trigger: String,
    pub match_mode: MatchMode,
    pub priority: i32,
    pub reply: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
