use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use wagate_common::models::Contact;
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContactRepository: Send + Sync {
    /// Merge-upsert by (user, session, phone). Non-null incoming values
    /// win, except `display_name`: an existing human-assigned name is
    /// never overwritten.
    async fn upsert(&self, contact: &Contact) -> Result<(), Error>;
    /// Batch variant used by the scraper; one transaction per batch.
    async fn upsert_batch(&self, contacts: &[Contact]) -> Result<(), Error>;
    async fn list(
        &self,
        user_id: Uuid,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Contact>, Error>;
    async fn count(&self, user_id: Uuid, session_id: &str) -> Result<i64, Error>;
}

pub struct PostgresContactRepository {
    pool: Pool<Postgres>,
}

impl PostgresContactRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO whatsapp_contacts (
        user_id, session_id, phone_number, display_name, push_name,
        is_business, is_group, metadata, last_message_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
    ON CONFLICT (user_id, session_id, phone_number) DO UPDATE
    SET display_name = COALESCE(whatsapp_contacts.display_name, EXCLUDED.display_name),
        push_name = COALESCE(EXCLUDED.push_name, whatsapp_contacts.push_name),
        is_business = whatsapp_contacts.is_business OR EXCLUDED.is_business,
        is_group = whatsapp_contacts.is_group OR EXCLUDED.is_group,
        metadata = COALESCE(NULLIF(EXCLUDED.metadata, 'null'::jsonb), whatsapp_contacts.metadata),
        last_message_at = GREATEST(whatsapp_contacts.last_message_at, EXCLUDED.last_message_at),
        updated_at = NOW()
"#;

#[async_trait]
impl ContactRepository for PostgresContactRepository {
    async fn upsert(&self, contact: &Contact) -> Result<(), Error> {
        sqlx::query(UPSERT_SQL)
            .bind(contact.user_id)
            .bind(&contact.session_id)
            .bind(&contact.phone_number)
            .bind(&contact.display_name)
            .bind(&contact.push_name)
            .bind(contact.is_business)
            .bind(contact.is_group)
            .bind(&contact.metadata)
            .bind(contact.last_message_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_batch(&self, contacts: &[Contact]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        for contact in contacts {
            sqlx::query(UPSERT_SQL)
                .bind(contact.user_id)
                .bind(&contact.session_id)
                .bind(&contact.phone_number)
                .bind(&contact.display_name)
                .bind(&contact.push_name)
                .bind(contact.is_business)
                .bind(contact.is_group)
                .bind(&contact.metadata)
                .bind(contact.last_message_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list(
        &self,
        user_id: Uuid,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Contact>, Error> {
        let rows = sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, user_id, session_id, phone_number, display_name,
                   push_name, is_business, is_group, metadata,
                   last_message_at, created_at, updated_at
            FROM whatsapp_contacts
            WHERE user_id = $1 AND session_id = $2
            ORDER BY COALESCE(display_name, push_name, phone_number) ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count(&self, user_id: Uuid, session_id: &str) -> Result<i64, Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM whatsapp_contacts WHERE user_id = $1 AND session_id = $2",
        )
        .bind(user_id)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
