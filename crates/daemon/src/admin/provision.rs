//! End-to-end account provisioning.
//!
//! `create_account` is the one RPC anyone may call. The flow suspends
//! on the web approval surface, so the vetted (possibly rewritten)
//! username lands back here before any key is minted. The requesting
//! client ends up whitelisted against the new key.

use std::collections::BTreeMap;
use std::path::Path;

use nostr_sdk::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};

use common::nip46::{Request, Response};

use crate::acl;
use crate::broker::BrokerError;
use crate::database::models::{AuditLog, KeyUser};
use crate::signer::Responder;
use crate::state::{AddKeyError, State};

/// Usernames nobody gets to request. The check applies to the
/// requested name only; an admin rewriting the name on the approval
/// form is trusted.
const RESERVED_USERNAMES: &[&str] = &["admin", "root", "_", "administrator", "__"];

const RANDOM_USERNAME_LEN: usize = 10;
const BASE36_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// The NIP-05 style public name directory a domain serves.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    names: BTreeMap<String, String>,
    #[serde(default)]
    relays: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("no domains configured")]
    NoDomains,
    #[error("missing username or domain")]
    BadParams,
    #[error("unknown domain '{0}'")]
    UnknownDomain(String),
    #[error("'{0}' is a reserved name")]
    ReservedName(String),
    #[error("username '{0}' is taken")]
    UsernameTaken(String),
    #[error("directory file error: {0}")]
    Directory(String),
    #[error("key error: {0}")]
    Key(#[from] nostr_sdk::key::Error),
    #[error(transparent)]
    AddKey(#[from] AddKeyError),
    #[error("policy store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub async fn handle_create_account(
    state: &State,
    responder: &Responder,
    requester: PublicKey,
    request: &Request,
) -> Response {
    let vetted = match vet_request(state, &request.params).await {
        Ok(vetted) => vetted,
        Err(e) => return Response::error(&request.id, e.to_string()),
    };

    let broker = state.broker();
    let ticket = match broker
        .open(None, &request.id, &requester.to_hex(), "create_account", &vetted)
        .await
    {
        Ok(ticket) => ticket,
        Err(e) => {
            tracing::error!("failed to open provisioning request: {}", e);
            return Response::error(&request.id, "internal error");
        }
    };

    let Some(url) = ticket.auth_url.clone() else {
        // the registration form is the only way to finish this flow
        broker.expire(&ticket.pending_id).await;
        return Response::error(&request.id, "account creation requires the approval page");
    };

    let _ = responder.send(&Response::auth_url(&request.id, url)).await;

    let approved = match broker.wait(ticket).await {
        Ok(params) => params,
        Err(BrokerError::Timeout) => {
            return Response::error(&request.id, "registration timed out")
        }
        Err(_) => return Response::error(&request.id, "registration rejected"),
    };

    match finalize_account(state, &requester.to_hex(), &approved).await {
        Ok(pubkey) => Response::ok(&request.id, pubkey.to_hex()),
        Err(e) => {
            tracing::error!("account provisioning failed: {}", e);
            Response::error(&request.id, e.to_string())
        }
    }
}

/// Validate the raw request and fill defaults: unknown domains are
/// rejected, an absent username becomes a random base36 one, and
/// reserved names are refused. Returns `[username, domain, email]`.
async fn vet_request(state: &State, params: &[String]) -> Result<Vec<String>, ProvisionError> {
    let config = state.app_config().await;
    if config.domains.is_empty() {
        return Err(ProvisionError::NoDomains);
    }

    let domain = match params.get(1).filter(|d| !d.is_empty()) {
        Some(domain) => {
            if !config.domains.contains_key(domain.as_str()) {
                return Err(ProvisionError::UnknownDomain(domain.clone()));
            }
            domain.clone()
        }
        // first configured domain by name order
        None => config.domains.keys().next().cloned().expect("non-empty"),
    };

    let username = match params.first().filter(|u| !u.is_empty()) {
        Some(username) => {
            if is_reserved(username) {
                return Err(ProvisionError::ReservedName(username.clone()));
            }
            username.to_lowercase()
        }
        None => random_username(),
    };

    let email = params.get(2).cloned().unwrap_or_default();
    Ok(vec![username, domain, email])
}

/// Complete provisioning after the admin's form resolved the pending
/// request with the final `[username, domain, email]`.
pub async fn finalize_account(
    state: &State,
    requester_pubkey: &str,
    params: &[String],
) -> Result<PublicKey, ProvisionError> {
    let username = params
        .first()
        .filter(|u| !u.is_empty())
        .ok_or(ProvisionError::BadParams)?
        .clone();
    let domain = params
        .get(1)
        .filter(|d| !d.is_empty())
        .ok_or(ProvisionError::BadParams)?
        .clone();

    let config = state.app_config().await;
    let domain_config = config
        .domains
        .get(&domain)
        .ok_or_else(|| ProvisionError::UnknownDomain(domain.clone()))?
        .clone();

    let mut directory = read_directory(&domain_config.directory)?;
    if directory.names.contains_key(&username) {
        return Err(ProvisionError::UsernameTaken(username));
    }

    let keys = Keys::generate();
    let pubkey = keys.public_key();
    let key_name = format!("{}@{}", username, domain);

    let relays = if domain_config.relays.is_empty() {
        config.nostr.relays.clone()
    } else {
        domain_config.relays.clone()
    };

    publish_profile(&keys, &relays, &username, &key_name).await;

    directory.names.insert(username.clone(), pubkey.to_hex());
    directory.relays.insert(pubkey.to_hex(), relays);
    write_directory(&domain_config.directory, &directory)?;

    // external side-effects are best-effort: a wallet or name service
    // outage must not lose the minted key
    if let Some(endpoint) = &domain_config.wallet_service {
        notify_service(endpoint.as_str(), &username, &domain, &pubkey.to_hex()).await;
    }
    if let Some(endpoint) = &domain_config.name_service {
        notify_service(endpoint.as_str(), &username, &domain, &pubkey.to_hex()).await;
    }

    let secret_hex = keys.secret_key()?.to_secret_hex();
    state.add_stored_key(&key_name, Some(&secret_hex), None).await?;

    for method in ["connect", "nip04_encrypt", "nip04_decrypt", "nip44_encrypt", "nip44_decrypt"] {
        acl::permit_all_requests(
            &key_name,
            requester_pubkey,
            method,
            None,
            Some("account creator"),
            state.database(),
        )
        .await?;
    }
    acl::permit_all_requests(
        &key_name,
        requester_pubkey,
        "sign_event",
        Some("all"),
        Some("account creator"),
        state.database(),
    )
    .await?;

    if let Ok(Some(key_user)) = KeyUser::find(&key_name, requester_pubkey, state.database()).await
    {
        let _ = AuditLog::append(
            "register",
            Some("create_account"),
            Some(&serde_json::to_string(params).unwrap_or_default()),
            Some(key_user.id),
            state.database(),
        )
        .await;
    }

    tracing::info!(key = %key_name, pubkey = %pubkey, "account provisioned");
    Ok(pubkey)
}

async fn publish_profile(keys: &Keys, relays: &[String], username: &str, nip05: &str) {
    let metadata = Metadata::new().name(username).nip05(nip05);
    let event = match EventBuilder::metadata(&metadata).to_event(keys) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("failed to build profile event: {}", e);
            return;
        }
    };

    let client = Client::new(keys);
    for relay in relays {
        let _ = client.add_relay(relay.clone()).await;
    }
    client.connect().await;
    if let Err(e) = client.send_event(event).await {
        tracing::warn!("failed to publish profile event: {}", e);
    }
    let _ = client.disconnect().await;
}

async fn notify_service(endpoint: &str, username: &str, domain: &str, pubkey: &str) {
    let body = serde_json::json!({
        "username": username,
        "domain": domain,
        "pubkey": pubkey,
    });
    let result = reqwest::Client::new()
        .post(endpoint)
        .json(&body)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            tracing::warn!("provisioning service {} returned {}", endpoint, response.status());
        }
        Err(e) => tracing::warn!("provisioning service {} unreachable: {}", endpoint, e),
    }
}

fn read_directory(path: &Path) -> Result<DirectoryFile, ProvisionError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            serde_json::from_str(&raw).map_err(|e| ProvisionError::Directory(e.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DirectoryFile::default()),
        Err(e) => Err(ProvisionError::Directory(e.to_string())),
    }
}

fn write_directory(path: &Path, directory: &DirectoryFile) -> Result<(), ProvisionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ProvisionError::Directory(e.to_string()))?;
    }
    let raw = serde_json::to_string_pretty(directory)
        .map_err(|e| ProvisionError::Directory(e.to_string()))?;
    std::fs::write(path, raw).map_err(|e| ProvisionError::Directory(e.to_string()))
}

fn random_username() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_USERNAME_LEN)
        .map(|_| BASE36_ALPHABET[rng.gen_range(0..BASE36_ALPHABET.len())] as char)
        .collect()
}

/// Whether a requested username is refused outright.
fn is_reserved(username: &str) -> bool {
    RESERVED_USERNAMES.contains(&username.to_lowercase().as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names() {
        for name in ["admin", "ADMIN", "root", "_", "administrator", "__"] {
            assert!(is_reserved(name), "{} should be reserved", name);
        }
        assert!(!is_reserved("alice"));
        assert!(!is_reserved("___"));
    }

    #[test]
    fn test_random_username_shape() {
        let name = random_username();
        assert_eq!(name.len(), RANDOM_USERNAME_LEN);
        assert!(name.bytes().all(|b| BASE36_ALPHABET.contains(&b)));
        // vanishingly unlikely to collide
        assert_ne!(random_username(), random_username());
    }

    #[test]
    fn test_directory_file_round_trip() {
        let mut dir = DirectoryFile::default();
        dir.names.insert("alice".into(), "ab".repeat(32));
        dir.relays.insert("ab".repeat(32), vec!["wss://r.example".into()]);

        let raw = serde_json::to_string(&dir).unwrap();
        let parsed: DirectoryFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.names.get("alice"), dir.names.get("alice"));
    }

    #[test]
    fn test_directory_missing_file_is_empty() {
        let dir = read_directory(Path::new("/nonexistent/dir/nostr.json")).unwrap();
        assert!(dir.names.is_empty());
    }
}
