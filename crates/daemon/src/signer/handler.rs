//! RPC dispatch for a user-key endpoint.

use nostr_sdk::prelude::*;
use serde::Deserialize;

use common::nip46::{Request, Response};

use crate::acl::{self, Decision};
use crate::broker::BrokerError;
use crate::database::models::{KeyUser, Token, TokenRedemptionError};
use crate::signer::Responder;
use crate::state::State;

/// Event fields a client may supply for `sign_event`. Anything else
/// in the object is ignored; `pubkey` and `id` are always ours to set.
#[derive(Debug, Deserialize)]
struct EventTemplate {
    kind: u16,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tags: Vec<Vec<String>>,
    #[serde(default)]
    created_at: Option<u64>,
}

pub async fn handle_request(
    state: &State,
    key_name: &str,
    keys: &Keys,
    responder: &Responder,
    request: &Request,
) -> Response {
    let client_pubkey = responder.peer().to_hex();

    // connect may carry a token; redemption happens before the ACL
    // ever sees the request so the minted grants decide it
    if request.method == "connect" {
        if let Some(token) = request.params.get(1).filter(|t| !t.is_empty()) {
            match Token::redeem(token, &client_pubkey, state.database()).await {
                Ok(key_user) => {
                    tracing::info!(
                        key = key_name,
                        client = %client_pubkey,
                        key_user = key_user.id,
                        "token redeemed on connect"
                    );
                }
                Err(e @ TokenRedemptionError::Database(_)) => {
                    tracing::error!(key = key_name, "token redemption failed: {}", e);
                    return Response::error(&request.id, "internal error");
                }
                Err(e) => return Response::error(&request.id, e.to_string()),
            }
        }
    }

    let params = match authorize(state, key_name, request, responder).await {
        Ok(params) => params,
        Err(message) => return Response::error(&request.id, message),
    };

    match execute(key_name, keys, &params, request).await {
        Ok(result) => Response::ok(&request.id, result),
        Err(message) => Response::error(&request.id, message),
    }
}

/// The authorization callback: consult the ACL, and on `unknown`
/// delegate to the broker. Resolves with the approved parameters,
/// which the admin's form may have rewritten.
async fn authorize(
    state: &State,
    key_name: &str,
    request: &Request,
    responder: &Responder,
) -> Result<Vec<String>, String> {
    let client_pubkey = responder.peer().to_hex();

    let decision = acl::evaluate(
        key_name,
        &client_pubkey,
        &request.method,
        request.params.first().map(String::as_str),
        state.database(),
    )
    .await
    .map_err(|e| {
        tracing::error!(key = key_name, "acl evaluation failed: {}", e);
        "internal error".to_string()
    })?;

    match decision {
        Decision::Allow => {
            if let Ok(Some(key_user)) =
                KeyUser::find(key_name, &client_pubkey, state.database()).await
            {
                let _ = KeyUser::touch_last_used(key_user.id, state.database()).await;
            }
            Ok(request.params.clone())
        }
        Decision::Deny => Err("not authorized".to_string()),
        Decision::Unknown => {
            let broker = state.broker();
            let ticket = broker
                .open(
                    Some(key_name),
                    &request.id,
                    &client_pubkey,
                    &request.method,
                    &request.params,
                )
                .await
                .map_err(|e| {
                    tracing::error!(key = key_name, "failed to open pending request: {}", e);
                    "internal error".to_string()
                })?;

            let outcome = match ticket.auth_url.clone() {
                Some(url) => {
                    // tell the client where the human went
                    let _ = responder
                        .send(&Response::auth_url(&request.id, url))
                        .await;
                    broker.wait(ticket).await
                }
                None => {
                    broker
                        .ask_admins(
                            ticket,
                            Some(key_name),
                            &client_pubkey,
                            &request.method,
                            &request.params,
                            None,
                        )
                        .await
                }
            };

            match outcome {
                Ok(params) => Ok(params),
                Err(BrokerError::Timeout) => Err("authorization timed out".to_string()),
                Err(BrokerError::Denied) => Err("not authorized".to_string()),
                Err(BrokerError::NoDecisionPath) => Err("no admin available".to_string()),
                Err(BrokerError::Store(e)) => {
                    tracing::error!(key = key_name, "broker store error: {}", e);
                    Err("internal error".to_string())
                }
            }
        }
    }
}

async fn execute(
    key_name: &str,
    keys: &Keys,
    params: &[String],
    request: &Request,
) -> Result<String, String> {
    match request.method.as_str() {
        "connect" => Ok("ack".to_string()),
        "ping" => Ok("pong".to_string()),
        "get_public_key" => Ok(keys.public_key().to_hex()),
        "sign_event" => sign_event(keys, params).await,
        "nip04_encrypt" => {
            let (pubkey, plaintext) = cipher_params(params)?;
            let secret_key = secret_key(keys)?;
            nip04::encrypt(secret_key, &pubkey, plaintext).map_err(|e| e.to_string())
        }
        "nip04_decrypt" => {
            let (pubkey, ciphertext) = cipher_params(params)?;
            let secret_key = secret_key(keys)?;
            nip04::decrypt(secret_key, &pubkey, ciphertext).map_err(|e| e.to_string())
        }
        "nip44_encrypt" => {
            let (pubkey, plaintext) = cipher_params(params)?;
            let secret_key = secret_key(keys)?;
            nip44::encrypt(secret_key, &pubkey, plaintext, nip44::Version::V2)
                .map_err(|e| e.to_string())
        }
        "nip44_decrypt" => {
            let (pubkey, ciphertext) = cipher_params(params)?;
            let secret_key = secret_key(keys)?;
            nip44::decrypt(secret_key, &pubkey, ciphertext).map_err(|e| e.to_string())
        }
        other => {
            tracing::debug!(key = key_name, method = other, "unknown method");
            Err("unknown method".to_string())
        }
    }
}

async fn sign_event(keys: &Keys, params: &[String]) -> Result<String, String> {
    let raw = params
        .first()
        .ok_or_else(|| "sign_event requires an event parameter".to_string())?;
    let template: EventTemplate =
        serde_json::from_str(raw).map_err(|e| format!("invalid event: {}", e))?;

    let mut tags = Vec::with_capacity(template.tags.len());
    for tag in template.tags {
        tags.push(Tag::parse(&tag).map_err(|e| format!("invalid tag: {}", e))?);
    }

    let mut builder = EventBuilder::new(Kind::from(template.kind), template.content, tags);
    if let Some(created_at) = template.created_at {
        builder = builder.custom_created_at(Timestamp::from(created_at));
    }

    let event = builder
        .to_event(keys)
        .map_err(|e| format!("signing failed: {}", e))?;
    Ok(event.as_json())
}

fn cipher_params(params: &[String]) -> Result<(PublicKey, &str), String> {
    let pubkey = params
        .first()
        .ok_or_else(|| "missing counterparty pubkey".to_string())?;
    let payload = params
        .get(1)
        .ok_or_else(|| "missing payload".to_string())?;
    let pubkey = PublicKey::from_hex(pubkey).map_err(|_| "invalid pubkey".to_string())?;
    Ok((pubkey, payload.as_str()))
}

fn secret_key(keys: &Keys) -> Result<&SecretKey, String> {
    keys.secret_key().map_err(|_| "internal error".to_string())
}
