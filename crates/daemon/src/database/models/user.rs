use sqlx::FromRow;
use time::OffsetDateTime;

use crate::database::Database;

/// Web-approval credential for a stored key.
///
/// Holds the bcrypt hash the approval page checks before an encrypted
/// key's requests may be approved.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub key_name: String,
    pub password_hash: String,
    pub created_at: OffsetDateTime,
}

impl User {
    pub async fn create(
        key_name: &str,
        password_hash: &str,
        db: &Database,
    ) -> Result<User, sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (key_name, password_hash, created_at) VALUES (?1, ?2, ?3)",
        )
        .bind(key_name)
        .bind(password_hash)
        .bind(OffsetDateTime::now_utc())
        .execute(&**db)
        .await?;

        Self::find_by_key_name(key_name, db)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_key_name(
        key_name: &str,
        db: &Database,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, key_name, password_hash, created_at FROM users WHERE key_name = ?1",
        )
        .bind(key_name)
        .fetch_optional(&**db)
        .await
    }
}
