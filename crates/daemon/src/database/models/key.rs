use sqlx::FromRow;
use time::OffsetDateTime;

use crate::database::Database;

/// A user key known to the policy store.
///
/// The secret material itself lives in the vault file; this row exists
/// so other entities can reference the key by name and so provisioning
/// completion is observable.
#[derive(Debug, Clone, FromRow)]
pub struct Key {
    pub id: i64,
    pub name: String,
    pub pubkey: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Key {
    pub async fn create(
        name: &str,
        pubkey: Option<&str>,
        db: &Database,
    ) -> Result<Key, sqlx::Error> {
        sqlx::query("INSERT INTO keys (name, pubkey, created_at) VALUES (?1, ?2, ?3)")
            .bind(name)
            .bind(pubkey)
            .bind(OffsetDateTime::now_utc())
            .execute(&**db)
            .await?;

        Self::find_by_name(name, db)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn find_by_name(name: &str, db: &Database) -> Result<Option<Key>, sqlx::Error> {
        sqlx::query_as::<_, Key>(
            "SELECT id, name, pubkey, created_at FROM keys WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&**db)
        .await
    }

    pub async fn count(db: &Database) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM keys")
            .fetch_one(&**db)
            .await?;
        Ok(count)
    }
}
