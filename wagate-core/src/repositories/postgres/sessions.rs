use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use wagate_common::models::{Session, SessionStatus};
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> Result<Session, Error>;
    async fn get(&self, session_id: &str) -> Result<Option<Session>, Error>;
    async fn get_owned(&self, session_id: &str, user_id: Uuid) -> Result<Option<Session>, Error>;
    async fn list_for_user(&self, user_id: Uuid, active_only: bool) -> Result<Vec<Session>, Error>;
    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), Error>;
    /// Pairing confirmed: status connected, phone recorded, QR cleared.
    async fn mark_connected(&self, session_id: &str, phone: &str) -> Result<(), Error>;
    /// Transport gone: status disconnected or failed, disconnect stamped.
    async fn mark_disconnected(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), Error>;
    async fn set_qr(
        &self,
        session_id: &str,
        qr_code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Error>;
    async fn clear_qr(&self, session_id: &str) -> Result<(), Error>;
    async fn soft_delete(&self, session_id: &str) -> Result<(), Error>;
    /// Sessions that were live before the process stopped, for restore.
    async fn connected_sessions(&self) -> Result<Vec<Session>, Error>;
}

pub struct PostgresSessionRepository {
    pool: Pool<Postgres>,
}

impl PostgresSessionRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const SESSION_COLUMNS: &str = r#"
    id, session_id, user_id, display_name, phone_number, status,
    qr_code, qr_expires_at, ai_assistant_type, ai_config, webhook_url,
    settings, last_connected_at, last_disconnected_at, is_active,
    deleted_at, created_at, updated_at
"#;

#[async_trait]
impl SessionRepository for PostgresSessionRepository {
    async fn create(&self, session: &Session) -> Result<Session, Error> {
        let row = sqlx::query_as::<_, Session>(&format!(
            r#"
            INSERT INTO whatsapp_sessions (
                session_id, user_id, display_name, phone_number, status,
                ai_assistant_type, ai_config, webhook_url, settings, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(&session.session_id)
        .bind(session.user_id)
        .bind(&session.display_name)
        .bind(&session.phone_number)
        .bind(session.status)
        .bind(&session.ai_assistant_type)
        .bind(&session.ai_config)
        .bind(&session.webhook_url)
        .bind(&session.settings)
        .bind(session.is_active)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Integrity(format!("session '{}' already exists", session.session_id))
            }
            _ => Error::Database(e),
        })?;
        Ok(row)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, Error> {
        let row = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM whatsapp_sessions
            WHERE session_id = $1 AND deleted_at IS NULL
            "#
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_owned(&self, session_id: &str, user_id: Uuid) -> Result<Option<Session>, Error> {
        let row = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM whatsapp_sessions
            WHERE session_id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_for_user(&self, user_id: Uuid, active_only: bool) -> Result<Vec<Session>, Error> {
        let rows = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM whatsapp_sessions
            WHERE user_id = $1
              AND deleted_at IS NULL
              AND ($2 = FALSE OR is_active = TRUE)
            ORDER BY created_at ASC
            "#
        ))
        .bind(user_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE whatsapp_sessions
            SET status = $2, updated_at = $3
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_connected(&self, session_id: &str, phone: &str) -> Result<(), Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE whatsapp_sessions
            SET status = 'connected',
                phone_number = $2,
                qr_code = NULL,
                qr_expires_at = NULL,
                last_connected_at = $3,
                updated_at = $3
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(phone)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_disconnected(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE whatsapp_sessions
            SET status = $2,
                last_disconnected_at = $3,
                updated_at = $3
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(status)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_qr(
        &self,
        session_id: &str,
        qr_code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE whatsapp_sessions
            SET qr_code = $2,
                qr_expires_at = $3,
                status = 'qr_pending',
                updated_at = $4
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(qr_code)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_qr(&self, session_id: &str) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE whatsapp_sessions
            SET qr_code = NULL, qr_expires_at = NULL, updated_at = $2
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete(&self, session_id: &str) -> Result<(), Error> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE whatsapp_sessions
            SET deleted_at = $2, is_active = FALSE, updated_at = $2
            WHERE session_id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn connected_sessions(&self) -> Result<Vec<Session>, Error> {
        let rows = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM whatsapp_sessions
            WHERE status = 'connected'
              AND is_active = TRUE
              AND deleted_at IS NULL
            ORDER BY id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
