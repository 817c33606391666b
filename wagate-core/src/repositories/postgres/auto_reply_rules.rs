use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use wagate_common::models::AutoReplyRule;
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AutoReplyRuleRepository: Send + Sync {
    /// Active rules for a session in evaluation order: priority descending,
    /// then id ascending.
    async fn active_for_session(&self, session_id: &str) -> Result<Vec<AutoReplyRule>, Error>;
}

pub struct PostgresAutoReplyRuleRepository {
    pool: Pool<Postgres>,
}

impl PostgresAutoReplyRuleRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AutoReplyRuleRepository for PostgresAutoReplyRuleRepository {
    async fn active_for_session(&self, session_id: &str) -> Result<Vec<AutoReplyRule>, Error> {
        let rows = sqlx::query_as::<_, AutoReplyRule>(
            r#"
            SELECT id, session_id, "trigger", match_mode, priority, reply,
                   is_active, created_at, updated_at
            FROM auto_reply_rules
            WHERE session_id = $1 AND is_active = TRUE
            ORDER BY priority DESC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
