//! Management RPC dispatch.
//!
//! Every method except `create_account` is gated on the admin
//! allow-list; an unauthorised call is rejected before any store
//! access happens.

use nostr_sdk::prelude::*;
use ::time::OffsetDateTime;

use common::nip46::{Request, Response};

use crate::admin::provision;
use crate::database::models::{KeyUser, Policy, PolicyRule, Token};
use crate::signer::Responder;
use crate::state::State;

pub async fn handle_rpc(
    state: &State,
    responder: &Responder,
    requester: PublicKey,
    request: &Request,
) -> Response {
    if request.method != "create_account" && !state.is_admin(&requester) {
        tracing::warn!(
            requester = %requester,
            method = %request.method,
            "rejecting management RPC from non-admin"
        );
        return Response::error(&request.id, "unauthorized");
    }

    match request.method.as_str() {
        "ping" => Response::ok(&request.id, "pong"),
        "get_keys" => get_keys(state, request).await,
        "get_key_users" => get_key_users(state, request).await,
        "get_key_tokens" => get_key_tokens(state, request).await,
        "get_policies" => get_policies(state, request).await,
        "create_new_key" => create_new_key(state, request).await,
        "create_new_policy" => create_new_policy(state, requester, request).await,
        "create_new_token" => create_new_token(state, requester, request).await,
        "rename_key_user" => rename_key_user(state, request).await,
        "revoke_user" => revoke_user(state, request).await,
        "unlock_key" => unlock_key(state, request).await,
        "create_account" => {
            provision::handle_create_account(state, responder, requester, request).await
        }
        _ => Response::error(&request.id, "unknown method"),
    }
}

fn ok_json(id: &str, value: serde_json::Value) -> Response {
    Response::ok(id, value.to_string())
}

fn unix(ts: OffsetDateTime) -> i64 {
    ts.unix_timestamp()
}

async fn get_keys(state: &State, request: &Request) -> Response {
    let config = state.app_config().await;
    let mut keys = Vec::new();
    for (name, stored) in &config.keys {
        let active = state.active_key(name).await;
        keys.push(serde_json::json!({
            "name": name,
            "encrypted": stored.is_encrypted(),
            "unlocked": active.is_some(),
            "npub": active.and_then(|k| k.public_key().to_bech32().ok()),
        }));
    }
    ok_json(&request.id, serde_json::Value::Array(keys))
}

async fn get_key_users(state: &State, request: &Request) -> Response {
    let Some(key_name) = request.params.first() else {
        return Response::error(&request.id, "missing key name");
    };
    match KeyUser::list_for_key(key_name, state.database()).await {
        Ok(rows) => {
            let rows: Vec<_> = rows
                .iter()
                .map(|ku| {
                    serde_json::json!({
                        "id": ku.id,
                        "pubkey": ku.user_pubkey,
                        "description": ku.description,
                        "createdAt": unix(ku.created_at),
                        "lastUsedAt": ku.last_used_at.map(unix),
                        "revokedAt": ku.revoked_at.map(unix),
                    })
                })
                .collect();
            ok_json(&request.id, serde_json::Value::Array(rows))
        }
        Err(e) => {
            tracing::error!("get_key_users failed: {}", e);
            Response::error(&request.id, "internal error")
        }
    }
}

async fn get_key_tokens(state: &State, request: &Request) -> Response {
    let Some(key_name) = request.params.first() else {
        return Response::error(&request.id, "missing key name");
    };
    match Token::list_for_key(key_name, state.database()).await {
        Ok(rows) => {
            let rows: Vec<_> = rows
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "token": t.token,
                        "clientName": t.client_name,
                        "policyId": t.policy_id,
                        "createdAt": unix(t.created_at),
                        "expiresAt": t.expires_at.map(unix),
                        "redeemedAt": t.redeemed_at.map(unix),
                    })
                })
                .collect();
            ok_json(&request.id, serde_json::Value::Array(rows))
        }
        Err(e) => {
            tracing::error!("get_key_tokens failed: {}", e);
            Response::error(&request.id, "internal error")
        }
    }
}

async fn get_policies(state: &State, request: &Request) -> Response {
    let policies = match Policy::list(state.database()).await {
        Ok(policies) => policies,
        Err(e) => {
            tracing::error!("get_policies failed: {}", e);
            return Response::error(&request.id, "internal error");
        }
    };

    let mut out = Vec::new();
    for policy in policies {
        let rules = Policy::rules(policy.id, state.database())
            .await
            .unwrap_or_default();
        let rules: Vec<_> = rules
            .iter()
            .map(|r| {
                serde_json::json!({
                    "method": r.method,
                    "kind": r.kind,
                    "maxUsageCount": r.max_usage_count,
                })
            })
            .collect();
        out.push(serde_json::json!({
            "id": policy.id,
            "name": policy.name,
            "description": policy.description,
            "expiresAt": policy.expires_at.map(unix),
            "rules": rules,
        }));
    }
    ok_json(&request.id, serde_json::Value::Array(out))
}

async fn create_new_key(state: &State, request: &Request) -> Response {
    let Some(name) = request.params.first().filter(|n| !n.is_empty()) else {
        return Response::error(&request.id, "missing key name");
    };
    let nsec = request.params.get(1).filter(|s| !s.is_empty());
    let passphrase = request.params.get(2).filter(|s| !s.is_empty());

    match state
        .add_stored_key(name, nsec.map(String::as_str), passphrase.map(String::as_str))
        .await
    {
        Ok(keys) => Response::ok(
            &request.id,
            keys.public_key().to_bech32().unwrap_or_else(|_| keys.public_key().to_hex()),
        ),
        Err(e) => Response::error(&request.id, e.to_string()),
    }
}

/// params: `[name, rules_json, description?, expires_at_unix?]` where
/// `rules_json` is an array of `{method, kind?, max_usage_count?}`.
async fn create_new_policy(state: &State, requester: PublicKey, request: &Request) -> Response {
    let Some(name) = request.params.first().filter(|n| !n.is_empty()) else {
        return Response::error(&request.id, "missing policy name");
    };
    let Some(rules_json) = request.params.get(1) else {
        return Response::error(&request.id, "missing rules");
    };
    let rules: Vec<PolicyRule> = match serde_json::from_str(rules_json) {
        Ok(rules) => rules,
        Err(e) => return Response::error(&request.id, format!("invalid rules: {}", e)),
    };
    let description = request.params.get(2).filter(|s| !s.is_empty());
    let expires_at = match request.params.get(3).filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<i64>().ok().and_then(|ts| {
            OffsetDateTime::from_unix_timestamp(ts).ok()
        }) {
            Some(ts) => Some(ts),
            None => return Response::error(&request.id, "invalid expiry timestamp"),
        },
        None => None,
    };

    let created_by = requester.to_hex();
    let policy = match Policy::create(
        name,
        description.map(String::as_str),
        Some(&created_by),
        expires_at,
        state.database(),
    )
    .await
    {
        Ok(policy) => policy,
        Err(e) => {
            tracing::error!("create_new_policy failed: {}", e);
            return Response::error(&request.id, "internal error");
        }
    };

    for rule in &rules {
        if let Err(e) = Policy::add_rule(
            policy.id,
            &rule.method,
            rule.kind.as_deref(),
            rule.max_usage_count,
            state.database(),
        )
        .await
        {
            tracing::error!("failed to add policy rule: {}", e);
            return Response::error(&request.id, "internal error");
        }
    }

    Response::ok(&request.id, policy.id.to_string())
}

/// params: `[key_name, client_name, policy_id, expires_at_unix?]`.
/// Replies with the freshly minted 256-bit token.
async fn create_new_token(state: &State, requester: PublicKey, request: &Request) -> Response {
    let (Some(key_name), Some(client_name), Some(policy_id)) = (
        request.params.first(),
        request.params.get(1),
        request.params.get(2),
    ) else {
        return Response::error(&request.id, "expected key name, client name, policy id");
    };
    let Ok(policy_id) = policy_id.parse::<i64>() else {
        return Response::error(&request.id, "invalid policy id");
    };
    if state.stored_key(key_name).await.is_none() {
        return Response::error(&request.id, "no such key");
    }
    match Policy::get(policy_id, state.database()).await {
        Ok(Some(_)) => {}
        Ok(None) => return Response::error(&request.id, "no such policy"),
        Err(e) => {
            tracing::error!("create_new_token failed: {}", e);
            return Response::error(&request.id, "internal error");
        }
    }
    let expires_at = match request.params.get(3).filter(|s| !s.is_empty()) {
        Some(raw) => match raw.parse::<i64>().ok().and_then(|ts| {
            OffsetDateTime::from_unix_timestamp(ts).ok()
        }) {
            Some(ts) => Some(ts),
            None => return Response::error(&request.id, "invalid expiry timestamp"),
        },
        None => None,
    };

    let mut nonce = [0u8; 32];
    if getrandom::getrandom(&mut nonce).is_err() {
        return Response::error(&request.id, "internal error");
    }
    let token = hex::encode(nonce);

    let created_by = requester.to_hex();
    match Token::create(
        &token,
        key_name,
        client_name,
        policy_id,
        Some(&created_by),
        expires_at,
        state.database(),
    )
    .await
    {
        Ok(row) => Response::ok(&request.id, row.token),
        Err(e) => {
            tracing::error!("create_new_token failed: {}", e);
            Response::error(&request.id, "internal error")
        }
    }
}

async fn rename_key_user(state: &State, request: &Request) -> Response {
    let (Some(id), Some(description)) = (request.params.first(), request.params.get(1)) else {
        return Response::error(&request.id, "expected key user id and description");
    };
    let Ok(id) = id.parse::<i64>() else {
        return Response::error(&request.id, "invalid key user id");
    };
    match KeyUser::rename(id, description, state.database()).await {
        Ok(true) => Response::ok(&request.id, "ok"),
        Ok(false) => Response::error(&request.id, "key user not found"),
        Err(e) => {
            tracing::error!("rename_key_user failed: {}", e);
            Response::error(&request.id, "internal error")
        }
    }
}

async fn revoke_user(state: &State, request: &Request) -> Response {
    let Some(id) = request.params.first() else {
        return Response::error(&request.id, "missing key user id");
    };
    let Ok(id) = id.parse::<i64>() else {
        return Response::error(&request.id, "invalid key user id");
    };
    match KeyUser::revoke(id, state.database()).await {
        Ok(true) => Response::ok(&request.id, "ok"),
        Ok(false) => Response::error(&request.id, "key user not found"),
        Err(e) => {
            tracing::error!("revoke_user failed: {}", e);
            Response::error(&request.id, "internal error")
        }
    }
}

async fn unlock_key(state: &State, request: &Request) -> Response {
    let (Some(key_name), Some(passphrase)) = (request.params.first(), request.params.get(1))
    else {
        return Response::error(&request.id, "expected key name and passphrase");
    };
    match state.unlock_key(key_name, passphrase).await {
        Ok(keys) => Response::ok(
            &request.id,
            keys.public_key().to_bech32().unwrap_or_else(|_| keys.public_key().to_hex()),
        ),
        Err(e) => Response::error(&request.id, e.to_string()),
    }
}
