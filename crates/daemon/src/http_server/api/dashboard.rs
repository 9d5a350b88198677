//! Dashboard aggregates: counts, recent audit entries, and a day of
//! hourly activity.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::database::models::{AuditLog, Key, KeyUser, PendingRequest};
use crate::state::State as ServiceState;

#[derive(Debug, Serialize)]
pub struct DashboardCounts {
    pub keys: i64,
    pub apps: i64,
    pub pending_requests: i64,
}

#[derive(Debug, Serialize)]
pub struct AuditEntry {
    #[serde(rename = "type")]
    pub entry_type: String,
    pub method: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
pub struct ActivityPoint {
    pub hour: i64,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub counts: DashboardCounts,
    pub recent: Vec<AuditEntry>,
    pub activity: Vec<ActivityPoint>,
}

pub async fn handler(
    State(state): State<ServiceState>,
) -> Result<impl IntoResponse, DashboardError> {
    let db = state.database();

    let counts = DashboardCounts {
        keys: Key::count(db).await?,
        apps: KeyUser::count_active(db).await?,
        pending_requests: PendingRequest::count_pending(db).await?,
    };

    let recent = AuditLog::last(5, db)
        .await?
        .into_iter()
        .map(|entry| AuditEntry {
            entry_type: entry.entry_type,
            method: entry.method,
            created_at: entry.created_at.unix_timestamp(),
        })
        .collect();

    let activity = AuditLog::hourly_activity(db)
        .await?
        .into_iter()
        .map(|bucket| ActivityPoint {
            hour: bucket.hour_start.unix_timestamp(),
            count: bucket.count,
        })
        .collect();

    Ok(Json(DashboardResponse {
        counts,
        recent,
        activity,
    }))
}

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let DashboardError::Database(e) = &self;
        tracing::error!("dashboard failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"ok": false, "error": "internal error"})),
        )
            .into_response()
    }
}
