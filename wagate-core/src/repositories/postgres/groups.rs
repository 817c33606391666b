use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use wagate_common::models::{Group, GroupMember};
use wagate_common::Error;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn upsert(&self, group: &Group) -> Result<Group, Error>;
    async fn get(
        &self,
        user_id: Uuid,
        session_id: &str,
        group_jid: &str,
    ) -> Result<Option<Group>, Error>;
    async fn get_by_id(&self, id: i64) -> Result<Option<Group>, Error>;
    async fn list(&self, user_id: Uuid, session_id: &str) -> Result<Vec<Group>, Error>;
    async fn upsert_member(&self, member: &GroupMember) -> Result<(), Error>;
    /// Recompute participant/admin counts from the member table.
    async fn refresh_counts(&self, group_id: i64) -> Result<(), Error>;
}

pub struct PostgresGroupRepository {
    pool: Pool<Postgres>,
}

impl PostgresGroupRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

const GROUP_COLUMNS: &str = r#"
    id, user_id, session_id, group_jid, name, description, owner_jid,
    participant_count, admin_count, is_announce, is_locked, metadata,
    created_at, updated_at
"#;

#[async_trait]
impl GroupRepository for PostgresGroupRepository {
    async fn upsert(&self, group: &Group) -> Result<Group, Error> {
        let row = sqlx::query_as::<_, Group>(&format!(
            r#"
            INSERT INTO whatsapp_groups (
                user_id, session_id, group_jid, name, description, owner_jid,
                participant_count, admin_count, is_announce, is_locked, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id, session_id, group_jid) DO UPDATE
            SET name = COALESCE(EXCLUDED.name, whatsapp_groups.name),
                description = COALESCE(EXCLUDED.description, whatsapp_groups.description),
                owner_jid = COALESCE(EXCLUDED.owner_jid, whatsapp_groups.owner_jid),
                participant_count = EXCLUDED.participant_count,
                admin_count = EXCLUDED.admin_count,
                is_announce = EXCLUDED.is_announce,
                is_locked = EXCLUDED.is_locked,
                metadata = COALESCE(NULLIF(EXCLUDED.metadata, 'null'::jsonb), whatsapp_groups.metadata),
                updated_at = NOW()
            RETURNING {GROUP_COLUMNS}
            "#
        ))
        .bind(group.user_id)
        .bind(&group.session_id)
        .bind(&group.group_jid)
        .bind(&group.name)
        .bind(&group.description)
        .bind(&group.owner_jid)
        .bind(group.participant_count)
        .bind(group.admin_count)
        .bind(group.is_announce)
        .bind(group.is_locked)
        .bind(&group.metadata)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get(
        &self,
        user_id: Uuid,
        session_id: &str,
        group_jid: &str,
    ) -> Result<Option<Group>, Error> {
        let row = sqlx::query_as::<_, Group>(&format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM whatsapp_groups
            WHERE user_id = $1 AND session_id = $2 AND group_jid = $3
            "#
        ))
        .bind(user_id)
        .bind(session_id)
        .bind(group_jid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Group>, Error> {
        let row = sqlx::query_as::<_, Group>(&format!(
            "SELECT {GROUP_COLUMNS} FROM whatsapp_groups WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list(&self, user_id: Uuid, session_id: &str) -> Result<Vec<Group>, Error> {
        let rows = sqlx::query_as::<_, Group>(&format!(
            r#"
            SELECT {GROUP_COLUMNS}
            FROM whatsapp_groups
            WHERE user_id = $1 AND session_id = $2
            ORDER BY COALESCE(name, group_jid) ASC
            "#
        ))
        .bind(user_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn upsert_member(&self, member: &GroupMember) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO whatsapp_group_members (
                group_id, participant_jid, phone_number, display_name,
                push_name, is_admin, is_super_admin, is_lid_format
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (group_id, participant_jid) DO UPDATE
            SET phone_number = COALESCE(EXCLUDED.phone_number, whatsapp_group_members.phone_number),
                display_name = COALESCE(EXCLUDED.display_name, whatsapp_group_members.display_name),
                push_name = COALESCE(EXCLUDED.push_name, whatsapp_group_members.push_name),
                is_admin = EXCLUDED.is_admin,
                is_super_admin = EXCLUDED.is_super_admin,
                is_lid_format = EXCLUDED.is_lid_format,
                updated_at = NOW()
            "#,
        )
        .bind(member.group_id)
        .bind(&member.participant_jid)
        .bind(&member.phone_number)
        .bind(&member.display_name)
        .bind(&member.push_name)
        .bind(member.is_admin)
        .bind(member.is_super_admin)
        .bind(member.is_lid_format)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh_counts(&self, group_id: i64) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE whatsapp_groups
            SET participant_count = sub.total,
                admin_count = sub.admins,
                updated_at = NOW()
            FROM (
                SELECT COUNT(*) AS total,
                       COUNT(*) FILTER (WHERE is_admin OR is_super_admin) AS admins
                FROM whatsapp_group_members
                WHERE group_id = $1
            ) AS sub
            WHERE whatsapp_groups.id = $1
            "#,
        )
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
