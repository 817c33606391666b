use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use wagate_common::models::RateBucket;
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimitRepository: Send + Sync {
    async fn get_or_create(&self, session_id: &str) -> Result<RateBucket, Error>;
    /// Zero lapsed hour/day windows and clear a lapsed cooldown, atomically,
    /// returning the refreshed bucket. The single UPDATE serializes
    /// concurrent senders on the row lock.
    async fn refresh(&self, session_id: &str, now: DateTime<Utc>) -> Result<RateBucket, Error>;
    /// Count one completed send; arms the cooldown when the hour counter
    /// reaches `cooldown_threshold`.
    async fn record_sent(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        cooldown_threshold: i32,
        cooldown_duration_ms: i64,
    ) -> Result<RateBucket, Error>;
}

pub struct PostgresRateLimitRepository {
    pool: Pool<Postgres>,
}

impl PostgresRateLimitRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const BUCKET_COLUMNS: &str = r#"
    id, session_id, messages_last_hour, messages_today, last_sent_at,
    cooldown_until, updated_at
"#;

#[async_trait]
impl RateLimitRepository for PostgresRateLimitRepository {
    async fn get_or_create(&self, session_id: &str) -> Result<RateBucket, Error> {
        sqlx::query(
            r#"
            INSERT INTO whatsapp_rate_limits (session_id)
            VALUES ($1)
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, RateBucket>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM whatsapp_rate_limits WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn refresh(&self, session_id: &str, now: DateTime<Utc>) -> Result<RateBucket, Error> {
        let row = sqlx::query_as::<_, RateBucket>(&format!(
            r#"
            UPDATE whatsapp_rate_limits
            SET messages_last_hour = CASE
                    WHEN last_sent_at IS NULL OR $2 - last_sent_at >= interval '1 hour'
                    THEN 0 ELSE messages_last_hour END,
                messages_today = CASE
                    WHEN last_sent_at IS NULL OR $2 - last_sent_at >= interval '24 hours'
                    THEN 0 ELSE messages_today END,
                cooldown_until = CASE
                    WHEN cooldown_until IS NOT NULL AND cooldown_until <= $2
                    THEN NULL ELSE cooldown_until END,
                updated_at = $2
            WHERE session_id = $1
            RETURNING {BUCKET_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(bucket) => Ok(bucket),
            None => self.get_or_create(session_id).await,
        }
    }

    async fn record_sent(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        cooldown_threshold: i32,
        cooldown_duration_ms: i64,
    ) -> Result<RateBucket, Error> {
        let row = sqlx::query_as::<_, RateBucket>(&format!(
            r#"
            UPDATE whatsapp_rate_limits
            SET messages_last_hour = messages_last_hour + 1,
                messages_today = messages_today + 1,
                last_sent_at = $2,
                cooldown_until = CASE
                    WHEN messages_last_hour + 1 >= $3
                    THEN $2 + make_interval(secs => $4::float8 / 1000.0)
                    ELSE cooldown_until END,
                updated_at = $2
            WHERE session_id = $1
            RETURNING {BUCKET_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(now)
        .bind(cooldown_threshold)
        .bind(cooldown_duration_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}
