//! Stored-key listing, creation, and import.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::app_config::AppConfigError;
use crate::state::{AddKeyError, State as ServiceState};

#[derive(Debug, Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub encrypted: bool,
    pub unlocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bunker_uri: Option<String>,
}

pub async fn list_handler(State(state): State<ServiceState>) -> impl IntoResponse {
    let config = state.app_config().await;
    let mut keys = Vec::new();

    for (name, stored) in &config.keys {
        let active = state.active_key(name).await;
        let (npub, bunker_uri) = match &active {
            Some(keys) => {
                let pubkey = keys.public_key();
                (
                    pubkey.to_bech32().ok(),
                    Some(state.bunker_uri(&pubkey, false).await.to_string()),
                )
            }
            None => (None, None),
        };
        keys.push(KeyInfo {
            name: name.clone(),
            encrypted: stored.is_encrypted(),
            unlocked: active.is_some(),
            npub,
            bunker_uri,
        });
    }

    Json(serde_json::json!({ "keys": keys }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub key_name: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub nsec: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    pub name: String,
    pub npub: String,
}

pub async fn create_handler(
    State(state): State<ServiceState>,
    Json(req): Json<CreateKeyRequest>,
) -> Result<impl IntoResponse, CreateKeyError> {
    let name = req.key_name.trim();
    if name.is_empty() {
        return Err(CreateKeyError::Input("key name is required".to_string()));
    }

    let keys = state
        .add_stored_key(name, req.nsec.as_deref(), req.passphrase.as_deref())
        .await?;

    let pubkey = keys.public_key();
    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            name: name.to_string(),
            npub: pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex()),
        }),
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum CreateKeyError {
    #[error("{0}")]
    Input(String),
    #[error(transparent)]
    Add(#[from] AddKeyError),
}

impl IntoResponse for CreateKeyError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CreateKeyError::Input(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CreateKeyError::Add(AddKeyError::Config(AppConfigError::DuplicateKey(name))) => (
                StatusCode::CONFLICT,
                format!("a key named '{}' already exists", name),
            ),
            CreateKeyError::Add(AddKeyError::BadSecret(_)) => {
                (StatusCode::BAD_REQUEST, "invalid nsec".to_string())
            }
            CreateKeyError::Add(e) => {
                tracing::error!("key creation failed: {}", e);
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
