use sqlx::FromRow;
use time::OffsetDateTime;

use crate::database::Database;

/// One row of the per-client grant table.
///
/// `method = '*'` with `allowed = false` is the wildcard veto: its
/// presence under a key-user denies every request regardless of other
/// rows. `kind` only applies to `sign_event` and is stored as a string
/// (a specific integer rendered as text, or the literal `"all"`).
#[derive(Debug, Clone, FromRow)]
pub struct SigningCondition {
    pub id: i64,
    pub key_user_id: i64,
    pub method: Option<String>,
    pub kind: Option<String>,
    pub allowed: Option<bool>,
    pub created_at: OffsetDateTime,
}

impl SigningCondition {
    pub async fn insert(
        key_user_id: i64,
        method: Option<&str>,
        kind: Option<&str>,
        allowed: bool,
        db: &Database,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO signing_conditions (key_user_id, method, kind, allowed, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(key_user_id)
        .bind(method)
        .bind(kind)
        .bind(allowed)
        .bind(OffsetDateTime::now_utc())
        .execute(&**db)
        .await?;
        Ok(())
    }

    pub async fn list_for_key_user(
        key_user_id: i64,
        db: &Database,
    ) -> Result<Vec<SigningCondition>, sqlx::Error> {
        sqlx::query_as::<_, SigningCondition>(
            r#"
            SELECT id, key_user_id, method, kind, allowed, created_at
            FROM signing_conditions
            WHERE key_user_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(key_user_id)
        .fetch_all(&**db)
        .await
    }

    /// Whether the always-consulted veto row exists for this key-user.
    pub async fn has_wildcard_deny(key_user_id: i64, db: &Database) -> Result<bool, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM signing_conditions
            WHERE key_user_id = ?1 AND method = '*' AND allowed = 0
            "#,
        )
        .bind(key_user_id)
        .fetch_one(&**db)
        .await?;
        Ok(count > 0)
    }

    /// Rows matching a method, with the kind constraint applied only
    /// when a kind set is given.
    pub async fn find_matches(
        key_user_id: i64,
        method: &str,
        kinds: Option<&[String]>,
        db: &Database,
    ) -> Result<Vec<SigningCondition>, sqlx::Error> {
        let rows = sqlx::query_as::<_, SigningCondition>(
            r#"
            SELECT id, key_user_id, method, kind, allowed, created_at
            FROM signing_conditions
            WHERE key_user_id = ?1 AND method = ?2
            ORDER BY id ASC
            "#,
        )
        .bind(key_user_id)
        .bind(method)
        .fetch_all(&**db)
        .await?;

        Ok(match kinds {
            None => rows,
            Some(kinds) => rows
                .into_iter()
                .filter(|row| match &row.kind {
                    Some(kind) => kinds.iter().any(|k| k == kind),
                    None => false,
                })
                .collect(),
        })
    }
}
