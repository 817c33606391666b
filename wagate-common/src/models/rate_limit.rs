use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-session send counters. One row per session, serialized by row-level
/// locking in the repository. Counters are approximate: they reset on the
/// first activity after the window lapses, not on a rolling window.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct RateBucket {
    pub id: i64,
    pub session_id: String,
    pub messages_last_hour: i32,
    pub messages_today: i32,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RateBucket {
    pub fn empty(session_id: &str) -> Self {
        Self {
            id: 0,
            session_id: session_id.to_string(),
            messages_last_hour: 0,
            messages_today: 0,
            last_sent_at: None,
            cooldown_until: None,
            updated_at: Utc::now(),
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if until > now)
    }
}
