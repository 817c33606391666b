use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use wagate_common::models::{BroadcastCampaign, BroadcastRecipient, CampaignStatus};
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CampaignRepository: Send + Sync {
    /// Insert the campaign and its recipients in one transaction.
    async fn create(
        &self,
        campaign: &BroadcastCampaign,
        recipients: &[(String, Option<String>)],
    ) -> Result<BroadcastCampaign, Error>;
    async fn get(&self, id: i64) -> Result<Option<BroadcastCampaign>, Error>;
    async fn get_owned(&self, id: i64, user_id: Uuid)
        -> Result<Option<BroadcastCampaign>, Error>;
    async fn list(
        &self,
        user_id: Uuid,
        status: Option<CampaignStatus>,
    ) -> Result<Vec<BroadcastCampaign>, Error>;
    /// Compare-and-set transition; returns false when the current status is
    /// not in `from`. Stamps started/completed timestamps as appropriate.
    async fn try_transition(
        &self,
        id: i64,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, Error>;
    async fn status(&self, id: i64) -> Result<Option<CampaignStatus>, Error>;
    async fn pending_recipients(&self, campaign_id: i64)
        -> Result<Vec<BroadcastRecipient>, Error>;
    async fn mark_recipient_sent(&self, recipient_id: i64, at: DateTime<Utc>)
        -> Result<(), Error>;
    async fn mark_recipient_failed(&self, recipient_id: i64, error: &str) -> Result<(), Error>;
    async fn update_counts(&self, campaign_id: i64, sent: i32, failed: i32) -> Result<(), Error>;
}

pub struct PostgresCampaignRepository {
    pool: Pool<Postgres>,
}

impl PostgresCampaignRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const CAMPAIGN_COLUMNS: &str = r#"
    id, user_id, session_id, name, template, status, scheduled_at,
    started_at, completed_at, total_recipients, sent_count, failed_count,
    batch_size, batch_delay_ms, created_at, updated_at
"#;

#[async_trait]
impl CampaignRepository for PostgresCampaignRepository {
    async fn create(
        &self,
        campaign: &BroadcastCampaign,
        recipients: &[(String, Option<String>)],
    ) -> Result<BroadcastCampaign, Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, BroadcastCampaign>(&format!(
            r#"
            INSERT INTO broadcast_campaigns (
                user_id, session_id, name, template, status, scheduled_at,
                total_recipients, batch_size, batch_delay_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {CAMPAIGN_COLUMNS}
            "#
        ))
        .bind(campaign.user_id)
        .bind(&campaign.session_id)
        .bind(&campaign.name)
        .bind(&campaign.template)
        .bind(campaign.status)
        .bind(campaign.scheduled_at)
        .bind(campaign.total_recipients)
        .bind(campaign.batch_size)
        .bind(campaign.batch_delay_ms)
        .fetch_one(&mut *tx)
        .await?;

        for (phone, name) in recipients {
            sqlx::query(
                r#"
                INSERT INTO broadcast_recipients (campaign_id, phone_number, name)
                VALUES ($1, $2, $3)
                ON CONFLICT (campaign_id, phone_number) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(phone)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<Option<BroadcastCampaign>, Error> {
        let row = sqlx::query_as::<_, BroadcastCampaign>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM broadcast_campaigns WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_owned(
        &self,
        id: i64,
        user_id: Uuid,
    ) -> Result<Option<BroadcastCampaign>, Error> {
        let row = sqlx::query_as::<_, BroadcastCampaign>(&format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM broadcast_campaigns WHERE id = $1 AND user_id = $2"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list(
        &self,
        user_id: Uuid,
        status: Option<CampaignStatus>,
    ) -> Result<Vec<BroadcastCampaign>, Error> {
        let rows = sqlx::query_as::<_, BroadcastCampaign>(&format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS}
            FROM broadcast_campaigns
            WHERE user_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .bind(status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn try_transition(
        &self,
        id: i64,
        from: &[CampaignStatus],
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let from_strs: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE broadcast_campaigns
            SET status = $3,
                started_at = CASE WHEN $3 = 'processing' THEN COALESCE(started_at, $4) ELSE started_at END,
                completed_at = CASE WHEN $3 IN ('completed', 'failed', 'cancelled')
                                    THEN COALESCE(completed_at, $4) ELSE completed_at END,
                updated_at = $4
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(&from_strs)
        .bind(to.to_string())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn status(&self, id: i64) -> Result<Option<CampaignStatus>, Error> {
        let row: Option<(CampaignStatus,)> =
            sqlx::query_as("SELECT status FROM broadcast_campaigns WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(s,)| s))
    }

    async fn pending_recipients(
        &self,
        campaign_id: i64,
    ) -> Result<Vec<BroadcastRecipient>, Error> {
        let rows = sqlx::query_as::<_, BroadcastRecipient>(
            r#"
            SELECT id, campaign_id, phone_number, name, status, sent_at,
                   error, created_at
            FROM broadcast_recipients
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY id ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_recipient_sent(
        &self,
        recipient_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE broadcast_recipients SET status = 'sent', sent_at = $2 WHERE id = $1",
        )
        .bind(recipient_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_recipient_failed(&self, recipient_id: i64, error: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE broadcast_recipients SET status = 'failed', error = $2 WHERE id = $1",
        )
        .bind(recipient_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_counts(&self, campaign_id: i64, sent: i32, failed: i32) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE broadcast_campaigns
            SET sent_count = $2, failed_count = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .bind(sent)
        .bind(failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
