use sqlx::FromRow;
use time::{Duration, OffsetDateTime};

use crate::database::Database;

/// Append-only trail of approvals and registrations.
#[derive(Debug, Clone, FromRow)]
pub struct AuditLog {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub entry_type: String,
    pub method: Option<String>,
    pub params: Option<String>,
    pub key_user_id: Option<i64>,
    pub created_at: OffsetDateTime,
}

/// One hour of activity for the dashboard chart.
#[derive(Debug, Clone)]
pub struct ActivityBucket {
    pub hour_start: OffsetDateTime,
    pub count: i64,
}

impl AuditLog {
    pub async fn append(
        entry_type: &str,
        method: Option<&str>,
        params: Option<&str>,
        key_user_id: Option<i64>,
        db: &Database,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (type, method, params, key_user_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(entry_type)
        .bind(method)
        .bind(params)
        .bind(key_user_id)
        .bind(OffsetDateTime::now_utc())
        .execute(&**db)
        .await?;
        Ok(())
    }

    pub async fn last(limit: u32, db: &Database) -> Result<Vec<AuditLog>, sqlx::Error> {
        sqlx::query_as::<_, AuditLog>(
            r#"
            SELECT id, type, method, params, key_user_id, created_at
            FROM audit_logs
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit.min(50) as i64)
        .fetch_all(&**db)
        .await
    }

    /// 24 hourly buckets ending at the current hour, oldest first.
    /// Empty hours are present with a zero count.
    pub async fn hourly_activity(db: &Database) -> Result<Vec<ActivityBucket>, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let window_start = now - Duration::hours(24);

        let rows: Vec<(OffsetDateTime,)> =
            sqlx::query_as("SELECT created_at FROM audit_logs WHERE created_at >= ?1")
                .bind(window_start)
                .fetch_all(&**db)
                .await?;

        let mut buckets: Vec<ActivityBucket> = (0..24)
            .map(|i| ActivityBucket {
                hour_start: window_start + Duration::hours(i),
                count: 0,
            })
            .collect();

        for (created_at,) in rows {
            let offset = (created_at - window_start).whole_hours();
            if (0..24).contains(&offset) {
                buckets[offset as usize].count += 1;
            }
        }

        Ok(buckets)
    }
}
