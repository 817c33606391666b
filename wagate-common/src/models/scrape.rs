use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScrapeTarget {
    Contacts,
    Groups,
    GroupMembers,
}

impl fmt::Display for ScrapeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrapeTarget::Contacts => "contacts",
            ScrapeTarget::Groups => "groups",
            ScrapeTarget::GroupMembers => "group_members",
        };
        write!(f, "{}", s)
    }
}

/// Append-only audit row, one per scraping attempt per (user, session).
/// Completed rows are what the daily quota and cooldown count against.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ScrapingLog {
    pub id: i64,
    pub user_id: Uuid,
    pub session_id: String,
    pub target: ScrapeTarget,
    pub status: ScrapeStatus,
    pub total_scraped: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
