//! Connection info endpoint: how to reach this bunker.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use nostr_sdk::prelude::*;
use serde::Serialize;

use crate::state::State as ServiceState;

#[derive(Debug, Serialize)]
pub struct ConnectionResponse {
    pub admin_pubkey: String,
    pub relays: Vec<String>,
    pub bunker_uris: Vec<String>,
}

pub async fn handler(State(state): State<ServiceState>) -> impl IntoResponse {
    let admin_pubkey = state.admin_keys().public_key();
    let mut uris = vec![state.bunker_uri(&admin_pubkey, true).await.to_string()];

    for name in state.active_key_names().await {
        if let Some(keys) = state.active_key(&name).await {
            uris.push(state.bunker_uri(&keys.public_key(), false).await.to_string());
        }
    }

    Json(ConnectionResponse {
        admin_pubkey: admin_pubkey
            .to_bech32()
            .unwrap_or_else(|_| admin_pubkey.to_hex()),
        relays: state.relays().await,
        bunker_uris: uris,
    })
}
