use sqlx::FromRow;
use time::OffsetDateTime;

use crate::database::Database;

/// A remote client authorised (or being authorised) against one user key.
///
/// `(key_name, user_pubkey)` is unique. Revocation is a soft delete via
/// `revoked_at`; the row and its signing conditions survive so the ACL
/// can keep returning an explicit deny.
#[derive(Debug, Clone, FromRow)]
pub struct KeyUser {
    pub id: i64,
    pub key_name: String,
    pub user_pubkey: String,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
}

/// Listing row for the dashboard: a key-user plus its request count.
#[derive(Debug, Clone, FromRow)]
pub struct KeyUserSummary {
    pub id: i64,
    pub key_name: String,
    pub user_pubkey: String,
    pub description: Option<String>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub request_count: i64,
}

const SELECT_COLUMNS: &str =
    "id, key_name, user_pubkey, description, created_at, last_used_at, revoked_at";

impl KeyUser {
    /// Find or create the row for `(key_name, user_pubkey)`.
    ///
    /// A fresh description never overwrites an existing one; the admin
    /// may have renamed the app.
    pub async fn upsert(
        key_name: &str,
        user_pubkey: &str,
        description: Option<&str>,
        db: &Database,
    ) -> Result<KeyUser, sqlx::Error> {
        if let Some(existing) = Self::find(key_name, user_pubkey, db).await? {
            return Ok(existing);
        }

        sqlx::query(
            r#"
            INSERT INTO key_users (key_name, user_pubkey, description, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (key_name, user_pubkey) DO NOTHING
            "#,
        )
        .bind(key_name)
        .bind(user_pubkey)
        .bind(description)
        .bind(OffsetDateTime::now_utc())
        .execute(&**db)
        .await?;

        Self::find(key_name, user_pubkey, db)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find(
        key_name: &str,
        user_pubkey: &str,
        db: &Database,
    ) -> Result<Option<KeyUser>, sqlx::Error> {
        sqlx::query_as::<_, KeyUser>(&format!(
            "SELECT {SELECT_COLUMNS} FROM key_users WHERE key_name = ?1 AND user_pubkey = ?2",
        ))
        .bind(key_name)
        .bind(user_pubkey)
        .fetch_optional(&**db)
        .await
    }

    pub async fn get(id: i64, db: &Database) -> Result<Option<KeyUser>, sqlx::Error> {
        sqlx::query_as::<_, KeyUser>(&format!(
            "SELECT {SELECT_COLUMNS} FROM key_users WHERE id = ?1",
        ))
        .bind(id)
        .fetch_optional(&**db)
        .await
    }

    pub async fn list_for_key(key_name: &str, db: &Database) -> Result<Vec<KeyUser>, sqlx::Error> {
        sqlx::query_as::<_, KeyUser>(&format!(
            "SELECT {SELECT_COLUMNS} FROM key_users WHERE key_name = ?1 ORDER BY created_at DESC",
        ))
        .bind(key_name)
        .fetch_all(&**db)
        .await
    }

    /// Non-revoked key-users with their approved-request counts.
    pub async fn list_active(db: &Database) -> Result<Vec<KeyUserSummary>, sqlx::Error> {
        sqlx::query_as::<_, KeyUserSummary>(
            r#"
            SELECT
                ku.id, ku.key_name, ku.user_pubkey, ku.description,
                ku.created_at, ku.last_used_at,
                (SELECT COUNT(*) FROM audit_logs al WHERE al.key_user_id = ku.id)
                    AS request_count
            FROM key_users ku
            WHERE ku.revoked_at IS NULL
            ORDER BY ku.created_at DESC
            "#,
        )
        .fetch_all(&**db)
        .await
    }

    pub async fn count_active(db: &Database) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM key_users WHERE revoked_at IS NULL")
                .fetch_one(&**db)
                .await?;
        Ok(count)
    }

    pub async fn rename(id: i64, description: &str, db: &Database) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE key_users SET description = ?1 WHERE id = ?2")
            .bind(description)
            .bind(id)
            .execute(&**db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn revoke(id: i64, db: &Database) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE key_users SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
        )
        .bind(OffsetDateTime::now_utc())
        .bind(id)
        .execute(&**db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_last_used(id: i64, db: &Database) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE key_users SET last_used_at = ?1 WHERE id = ?2")
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&**db)
            .await?;
        Ok(())
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}
