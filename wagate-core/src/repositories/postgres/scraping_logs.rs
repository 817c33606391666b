use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use wagate_common::models::{ScrapeTarget, ScrapingLog};
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScrapingLogRepository: Send + Sync {
    async fn start(
        &self,
        user_id: Uuid,
        session_id: &str,
        target: ScrapeTarget,
        at: DateTime<Utc>,
    ) -> Result<ScrapingLog, Error>;
    async fn complete(&self, id: i64, total: i32, at: DateTime<Utc>) -> Result<(), Error>;
    async fn fail(&self, id: i64, error: &str, at: DateTime<Utc>) -> Result<(), Error>;
    /// Completed scrapes since `since` (callers pass the calendar-day
    /// start for quota checks).
    async fn completed_count_since(
        &self,
        user_id: Uuid,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, Error>;
    async fn last_completed_at(
        &self,
        user_id: Uuid,
        session_id: &str,
    ) -> Result<Option<DateTime<Utc>>, Error>;
}

pub struct PostgresScrapingLogRepository {
    pool: Pool<Postgres>,
}

impl PostgresScrapingLogRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScrapingLogRepository for PostgresScrapingLogRepository {
    async fn start(
        &self,
        user_id: Uuid,
        session_id: &str,
        target: ScrapeTarget,
        at: DateTime<Utc>,
    ) -> Result<ScrapingLog, Error> {
        let row = sqlx::query_as::<_, ScrapingLog>(
            r#"
            INSERT INTO scraping_logs (user_id, session_id, target, status, started_at)
            VALUES ($1, $2, $3, 'in_progress', $4)
            RETURNING id, user_id, session_id, target, status, total_scraped,
                      started_at, finished_at, error
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(target)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn complete(&self, id: i64, total: i32, at: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE scraping_logs
            SET status = 'completed', total_scraped = $2, finished_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, id: i64, error: &str, at: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE scraping_logs
            SET status = 'failed', error = $2, finished_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn completed_count_since(
        &self,
        user_id: Uuid,
        session_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, Error> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM scraping_logs
            WHERE user_id = $1 AND session_id = $2
              AND status = 'completed' AND finished_at >= $3
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn last_completed_at(
        &self,
        user_id: Uuid,
        session_id: &str,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let row: Option<(Option<DateTime<Utc>>,)> = sqlx::query_as(
            r#"
            SELECT MAX(finished_at)
            FROM scraping_logs
            WHERE user_id = $1 AND session_id = $2 AND status = 'completed'
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(at,)| at))
    }
}
