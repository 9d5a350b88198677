//! Pending-request listing and approval.

use axum::extract::{Json, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::acl;
use crate::app_config::StoredKey;
use crate::broker::Verdict;
use crate::database::models::{AuditLog, PendingRequest, RequestStatus, User};
use crate::state::State as ServiceState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Kind, content, and tags pulled out of a `sign_event` payload so the
/// dashboard can render what is about to be signed. A payload that
/// fails to parse simply yields no preview.
#[derive(Debug, Serialize)]
pub struct EventPreview {
    pub kind: u64,
    pub content: String,
    pub tags: Vec<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct RequestInfo {
    pub id: String,
    pub key_name: Option<String>,
    pub remote_pubkey: String,
    pub method: String,
    pub params: Vec<String>,
    pub allowed: Option<bool>,
    pub created_at: i64,
    pub ttl_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_preview: Option<EventPreview>,
}

impl From<&PendingRequest> for RequestInfo {
    fn from(row: &PendingRequest) -> Self {
        let params = row.params_vec();
        let event_preview = (row.method == "sign_event")
            .then(|| params.first().and_then(|p| parse_preview(p)))
            .flatten();

        Self {
            id: row.id.clone(),
            key_name: row.key_name.clone(),
            remote_pubkey: row.remote_pubkey.clone(),
            method: row.method.clone(),
            params,
            allowed: row.allowed,
            created_at: row.created_at.unix_timestamp(),
            ttl_seconds: row.ttl_seconds(),
            event_preview,
        }
    }
}

fn parse_preview(param: &str) -> Option<EventPreview> {
    let value: serde_json::Value = serde_json::from_str(param).ok()?;
    Some(EventPreview {
        kind: value.get("kind")?.as_u64()?,
        content: value
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
        tags: value
            .get("tags")
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default(),
    })
}

pub async fn list_handler(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ListRequestsError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<RequestStatus>()
                .map_err(|_| ListRequestsError::BadStatus(raw.to_string()))?,
        ),
    };
    let limit = query.limit.unwrap_or(50).min(50);
    let offset = query.offset.unwrap_or(0);

    let rows = PendingRequest::list(status, limit, offset, state.database()).await?;
    let requests: Vec<RequestInfo> = rows.iter().map(RequestInfo::from).collect();
    Ok(Json(serde_json::json!({ "requests": requests })))
}

#[derive(Debug, thiserror::Error)]
pub enum ListRequestsError {
    #[error("unknown status filter '{0}'")]
    BadStatus(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ListRequestsError {
    fn into_response(self) -> Response {
        match self {
            ListRequestsError::BadStatus(_) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"ok": false, "error": self.to_string()})),
            )
                .into_response(),
            ListRequestsError::Database(e) => {
                tracing::error!("request listing failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({"ok": false, "error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ApproveBody {
    pub password: Option<String>,
}

/// Approve a pending request.
///
/// A plain-text key approves without a password; an encrypted key
/// requires the user password checked against its bcrypt hash.
/// Approval writes the blanket allow conditions (`connect` also grants
/// `sign_event` for all kinds), appends an audit entry, and wakes the
/// suspended request.
pub async fn approve_handler(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    body: Option<Json<ApproveBody>>,
) -> Result<impl IntoResponse, ApproveError> {
    let Json(body) = body.unwrap_or_default();

    let row = PendingRequest::get(&id, state.database())
        .await?
        .ok_or(ApproveError::NotFound)?;

    if row.allowed.is_some() {
        // already decided; approving twice is a no-op
        return Ok(Json(serde_json::json!({"ok": true})));
    }

    if let Some(key_name) = &row.key_name {
        let stored = state
            .stored_key(key_name)
            .await
            .ok_or(ApproveError::NotFound)?;

        if matches!(stored, StoredKey::Encrypted(_)) {
            let password = body
                .password
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| ApproveError::Unauthorized("password required".to_string()))?;
            let user = User::find_by_key_name(key_name, state.database())
                .await?
                .ok_or_else(|| {
                    ApproveError::Unauthorized("no user registered for this key".to_string())
                })?;
            let valid = bcrypt::verify(password, &user.password_hash)
                .map_err(|_| ApproveError::Unauthorized("wrong password".to_string()))?;
            if !valid {
                return Err(ApproveError::Unauthorized("wrong password".to_string()));
            }
        }

        let key_user = match row.method.as_str() {
            "sign_event" => {
                acl::permit_all_requests(
                    key_name,
                    &row.remote_pubkey,
                    "sign_event",
                    Some("all"),
                    None,
                    state.database(),
                )
                .await?
            }
            "connect" => {
                let key_user = acl::permit_all_requests(
                    key_name,
                    &row.remote_pubkey,
                    "connect",
                    None,
                    None,
                    state.database(),
                )
                .await?;
                acl::permit_all_requests(
                    key_name,
                    &row.remote_pubkey,
                    "sign_event",
                    Some("all"),
                    None,
                    state.database(),
                )
                .await?;
                key_user
            }
            method => {
                acl::permit_all_requests(
                    key_name,
                    &row.remote_pubkey,
                    method,
                    None,
                    None,
                    state.database(),
                )
                .await?
            }
        };

        AuditLog::append(
            "approval",
            Some(&row.method),
            Some(&row.params),
            Some(key_user.id),
            state.database(),
        )
        .await?;
    }

    PendingRequest::decide(&id, true, None, state.database()).await?;
    state.broker().resolve(&id, Verdict::Approved).await;

    Ok(Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, thiserror::Error)]
pub enum ApproveError {
    #[error("request not found")]
    NotFound,
    #[error("{0}")]
    Unauthorized(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApproveError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApproveError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApproveError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApproveError::Database(e) => {
                tracing::error!("approval failed: {}", e);
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
