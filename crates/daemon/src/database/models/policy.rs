use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::database::Database;

/// A named, optionally-expiring bundle of rule templates.
///
/// Rules are applied at token redemption time to seed a key-user's
/// signing conditions; they are never consulted directly at request
/// time.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Policy {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_by: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub policy_id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub max_usage_count: Option<i64>,
    #[serde(default)]
    pub current_usage_count: i64,
}

impl Policy {
    pub async fn create(
        name: &str,
        description: Option<&str>,
        created_by: Option<&str>,
        expires_at: Option<OffsetDateTime>,
        db: &Database,
    ) -> Result<Policy, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO policies (name, description, created_by, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(created_by)
        .bind(OffsetDateTime::now_utc())
        .bind(expires_at)
        .execute(&**db)
        .await?;

        Self::get(result.last_insert_rowid(), db)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(id: i64, db: &Database) -> Result<Option<Policy>, sqlx::Error> {
        sqlx::query_as::<_, Policy>(
            r#"
            SELECT id, name, description, created_by, created_at, expires_at
            FROM policies
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&**db)
        .await
    }

    pub async fn list(db: &Database) -> Result<Vec<Policy>, sqlx::Error> {
        sqlx::query_as::<_, Policy>(
            r#"
            SELECT id, name, description, created_by, created_at, expires_at
            FROM policies
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&**db)
        .await
    }

    pub async fn add_rule(
        policy_id: i64,
        method: &str,
        kind: Option<&str>,
        max_usage_count: Option<i64>,
        db: &Database,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO policy_rules (policy_id, method, kind, max_usage_count)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(policy_id)
        .bind(method)
        .bind(kind)
        .bind(max_usage_count)
        .execute(&**db)
        .await?;
        Ok(())
    }

    pub async fn rules(policy_id: i64, db: &Database) -> Result<Vec<PolicyRule>, sqlx::Error> {
        sqlx::query_as::<_, PolicyRule>(
            r#"
            SELECT id, policy_id, method, kind, max_usage_count, current_usage_count
            FROM policy_rules
            WHERE policy_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(policy_id)
        .fetch_all(&**db)
        .await
    }
}
