//! Registration-form completion for account provisioning.
//!
//! The admin's form vets `[username, domain, email]`, the pending
//! request resolves, and the suspended `create_account` RPC takes over
//! on the daemon side. This handler then waits for the Key row to
//! appear before storing the web-approval credential.

use std::time::Duration;

use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::broker::Verdict;
use crate::database::models::{Key, PendingRequest, User};
use crate::state::State as ServiceState;

/// bcrypt cost for stored user passwords
const PASSWORD_HASH_COST: u32 = 10;

const KEY_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const KEY_WAIT_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
pub struct RegisterForm {
    pub username: String,
    pub domain: String,
    #[serde(default)]
    pub email: String,
    pub password: String,
}

pub async fn handler(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    Form(form): Form<RegisterForm>,
) -> Result<impl IntoResponse, RegisterError> {
    let row = PendingRequest::get(&id, state.database())
        .await?
        .ok_or(RegisterError::NotFound)?;
    if row.method != "create_account" {
        return Err(RegisterError::Input(
            "not an account registration request".to_string(),
        ));
    }

    let username = form.username.trim().to_lowercase();
    if username.is_empty() {
        return Err(RegisterError::Input("username is required".to_string()));
    }
    if form.password.is_empty() {
        return Err(RegisterError::Input("password is required".to_string()));
    }
    let config = state.app_config().await;
    if !config.domains.contains_key(&form.domain) {
        return Err(RegisterError::Input(format!(
            "unknown domain '{}'",
            form.domain
        )));
    }

    let vetted = vec![username.clone(), form.domain.clone(), form.email.clone()];
    PendingRequest::decide(&id, true, Some(&vetted), state.database()).await?;
    state.broker().resolve(&id, Verdict::Approved).await;

    // provisioning happens on the daemon side of the suspended RPC;
    // the Key row appearing is the completion signal
    let key_name = format!("{}@{}", username, form.domain);
    let key = wait_for_key(&state, &key_name).await?;

    let password_hash = bcrypt::hash(&form.password, PASSWORD_HASH_COST)
        .map_err(|e| RegisterError::Internal(e.to_string()))?;
    User::create(&key_name, &password_hash, state.database()).await?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "keyName": key_name,
        "pubkey": key.pubkey,
    })))
}

async fn wait_for_key(state: &ServiceState, key_name: &str) -> Result<Key, RegisterError> {
    let deadline = tokio::time::Instant::now() + KEY_WAIT_TIMEOUT;
    loop {
        if let Some(key) = Key::find_by_name(key_name, state.database()).await? {
            return Ok(key);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RegisterError::ProvisioningTimeout);
        }
        tokio::time::sleep(KEY_WAIT_POLL).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("request not found")]
    NotFound,
    #[error("{0}")]
    Input(String),
    #[error("provisioning did not complete in time")]
    ProvisioningTimeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for RegisterError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RegisterError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            RegisterError::Input(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            RegisterError::ProvisioningTimeout => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            RegisterError::Database(e) => {
                tracing::error!("registration failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
            RegisterError::Internal(msg) => {
                tracing::error!("registration failed: {}", msg);
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
