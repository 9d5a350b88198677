//! Connected-app management: the non-revoked key-users.

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::database::models::{KeyUser, SigningCondition};
use crate::state::State as ServiceState;

#[derive(Debug, Serialize)]
pub struct AppInfo {
    pub id: i64,
    pub key_name: String,
    pub pubkey: String,
    pub description: Option<String>,
    pub permissions: Vec<String>,
    pub request_count: i64,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

/// Human-readable summary of one signing condition.
fn describe_condition(condition: &SigningCondition) -> Option<String> {
    let method = condition.method.as_deref()?;
    if method == "*" && condition.allowed == Some(false) {
        return Some("all requests denied".to_string());
    }
    let verb = match condition.allowed {
        Some(true) => "",
        Some(false) => "deny ",
        None => return None,
    };
    Some(match condition.kind.as_deref() {
        Some(kind) => format!("{}{} (kind {})", verb, method, kind),
        None => format!("{}{}", verb, method),
    })
}

pub async fn list_handler(
    State(state): State<ServiceState>,
) -> Result<impl IntoResponse, AppsError> {
    let rows = KeyUser::list_active(state.database()).await?;

    let mut apps = Vec::with_capacity(rows.len());
    for row in rows {
        let conditions = SigningCondition::list_for_key_user(row.id, state.database()).await?;
        let mut permissions: Vec<String> =
            conditions.iter().filter_map(describe_condition).collect();
        permissions.dedup();

        apps.push(AppInfo {
            id: row.id,
            key_name: row.key_name,
            pubkey: row.user_pubkey,
            description: row.description,
            permissions,
            request_count: row.request_count,
            created_at: row.created_at.unix_timestamp(),
            last_used_at: row.last_used_at.map(|t| t.unix_timestamp()),
        });
    }

    Ok(Json(serde_json::json!({ "apps": apps })))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub description: String,
}

pub async fn rename_handler(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
    Json(req): Json<RenameRequest>,
) -> Result<impl IntoResponse, AppsError> {
    let renamed = KeyUser::rename(id, &req.description, state.database()).await?;
    if !renamed {
        return Err(AppsError::NotFound);
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

pub async fn revoke_handler(
    State(state): State<ServiceState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppsError> {
    let revoked = KeyUser::revoke(id, state.database()).await?;
    if !revoked {
        return Err(AppsError::NotFound);
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, thiserror::Error)]
pub enum AppsError {
    #[error("app not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for AppsError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppsError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppsError::Database(e) => {
                tracing::error!("apps endpoint failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (
            status,
            Json(serde_json::json!({"ok": false, "error": message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn condition(method: &str, kind: Option<&str>, allowed: bool) -> SigningCondition {
        SigningCondition {
            id: 0,
            key_user_id: 0,
            method: Some(method.to_string()),
            kind: kind.map(str::to_string),
            allowed: Some(allowed),
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_describe_condition() {
        assert_eq!(
            describe_condition(&condition("sign_event", Some("all"), true)).unwrap(),
            "sign_event (kind all)"
        );
        assert_eq!(
            describe_condition(&condition("connect", None, true)).unwrap(),
            "connect"
        );
        assert_eq!(
            describe_condition(&condition("*", None, false)).unwrap(),
            "all requests denied"
        );
        assert_eq!(
            describe_condition(&condition("sign_event", Some("4"), false)).unwrap(),
            "deny sign_event (kind 4)"
        );
    }
}
