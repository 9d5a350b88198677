use sqlx::FromRow;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::database::Database;

/// Wall-clock lifetime of an undecided request.
pub const PENDING_REQUEST_TTL_SECS: i64 = 60;

/// Listing filter for the requests endpoint.
///
/// "Pending" is undecided and younger than the TTL; "expired" is
/// undecided and older; "approved" is decided true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Approved,
    Expired,
}

impl std::str::FromStr for RequestStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "expired" => Ok(Self::Expired),
            _ => Err(()),
        }
    }
}

/// An authorization decision waiting on the administrator.
///
/// Transitions from `allowed = NULL` to true or false exactly once;
/// the reaper removes the row 60 s after creation either way.
#[derive(Debug, Clone, FromRow)]
pub struct PendingRequest {
    pub id: String,
    pub request_id: String,
    pub key_name: Option<String>,
    pub remote_pubkey: String,
    pub method: String,
    pub params: String,
    pub allowed: Option<bool>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

const SELECT_COLUMNS: &str =
    "id, request_id, key_name, remote_pubkey, method, params, allowed, created_at, processed_at";

impl PendingRequest {
    pub async fn create(
        request_id: &str,
        key_name: Option<&str>,
        remote_pubkey: &str,
        method: &str,
        params: &[String],
        db: &Database,
    ) -> Result<PendingRequest, sqlx::Error> {
        let id = Uuid::new_v4().to_string();
        let params_json =
            serde_json::to_string(params).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query(
            r#"
            INSERT INTO pending_requests
                (id, request_id, key_name, remote_pubkey, method, params, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&id)
        .bind(request_id)
        .bind(key_name)
        .bind(remote_pubkey)
        .bind(method)
        .bind(params_json)
        .bind(OffsetDateTime::now_utc())
        .execute(&**db)
        .await?;

        Self::get(&id, db).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(id: &str, db: &Database) -> Result<Option<PendingRequest>, sqlx::Error> {
        sqlx::query_as::<_, PendingRequest>(&format!(
            "SELECT {SELECT_COLUMNS} FROM pending_requests WHERE id = ?1",
        ))
        .bind(id)
        .fetch_optional(&**db)
        .await
    }

    /// Record the decision, optionally rewriting the stored params
    /// (the admin's form may vet or replace them).
    ///
    /// Only an undecided row transitions; deciding twice is a no-op
    /// that reports `false`.
    pub async fn decide(
        id: &str,
        allowed: bool,
        params_override: Option<&[String]>,
        db: &Database,
    ) -> Result<bool, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        let result = match params_override {
            Some(params) => {
                let params_json =
                    serde_json::to_string(params).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
                sqlx::query(
                    r#"
                    UPDATE pending_requests
                    SET allowed = ?1, params = ?2, processed_at = ?3
                    WHERE id = ?4 AND allowed IS NULL
                    "#,
                )
                .bind(allowed)
                .bind(params_json)
                .bind(now)
                .bind(id)
                .execute(&**db)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE pending_requests
                    SET allowed = ?1, processed_at = ?2
                    WHERE id = ?3 AND allowed IS NULL
                    "#,
                )
                .bind(allowed)
                .bind(now)
                .bind(id)
                .execute(&**db)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    /// Remove the row at end of life. Returns `true` when the reaped
    /// row was still undecided, which is the expiry signal.
    pub async fn reap(id: &str, db: &Database) -> Result<bool, sqlx::Error> {
        let undecided: Option<(String,)> =
            sqlx::query_as("SELECT id FROM pending_requests WHERE id = ?1 AND allowed IS NULL")
                .bind(id)
                .fetch_optional(&**db)
                .await?;

        sqlx::query("DELETE FROM pending_requests WHERE id = ?1")
            .bind(id)
            .execute(&**db)
            .await?;

        Ok(undecided.is_some())
    }

    pub async fn list(
        status: Option<RequestStatus>,
        limit: u32,
        offset: u32,
        db: &Database,
    ) -> Result<Vec<PendingRequest>, sqlx::Error> {
        let limit = limit.min(50) as i64;
        let offset = offset as i64;
        let cutoff = OffsetDateTime::now_utc() - Duration::seconds(PENDING_REQUEST_TTL_SECS);

        let filter = match status {
            None => "1 = 1",
            Some(RequestStatus::Pending) => "allowed IS NULL AND created_at >= ?3",
            Some(RequestStatus::Approved) => "allowed = 1",
            Some(RequestStatus::Expired) => "allowed IS NULL AND created_at < ?3",
        };

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM pending_requests WHERE {filter} \
             ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
        );

        let mut query = sqlx::query_as::<_, PendingRequest>(&sql)
            .bind(limit)
            .bind(offset);
        if matches!(
            status,
            Some(RequestStatus::Pending) | Some(RequestStatus::Expired)
        ) {
            query = query.bind(cutoff);
        }

        query.fetch_all(&**db).await
    }

    pub async fn count_pending(db: &Database) -> Result<i64, sqlx::Error> {
        let cutoff = OffsetDateTime::now_utc() - Duration::seconds(PENDING_REQUEST_TTL_SECS);
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pending_requests WHERE allowed IS NULL AND created_at >= ?1",
        )
        .bind(cutoff)
        .fetch_one(&**db)
        .await?;
        Ok(count)
    }

    pub fn params_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.params).unwrap_or_default()
    }

    /// Seconds of approval window left for an undecided request.
    pub fn ttl_seconds(&self) -> i64 {
        let age = (OffsetDateTime::now_utc() - self.created_at).whole_seconds();
        (PENDING_REQUEST_TTL_SECS - age).max(0)
    }
}
