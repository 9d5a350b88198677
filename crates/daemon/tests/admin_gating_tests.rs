//! Management RPCs are gated on the admin allow-list: an unauthorised
//! call produces an error response and zero store writes.

use nostr_sdk::prelude::*;
use tempfile::TempDir;
use ::url::Url;

use ::common::nip46::Request;
use bunker_daemon::admin::rpc;
use bunker_daemon::app_config::{AppConfig, AppState};
use bunker_daemon::signer::{Cipher, Responder};
use bunker_daemon::{ServiceConfig, ServiceState};

async fn setup_state(admin: Option<&Keys>) -> (ServiceState, TempDir) {
    let dir = TempDir::new().unwrap();
    let app = AppState {
        config: AppConfig::default(),
        path: dir.path().join("bunker.json"),
    };
    let database_url = Url::parse(&format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("test.db").display()
    ))
    .ok();

    let config = ServiceConfig {
        app,
        unlocked_keys: vec![],
        extra_admins: admin
            .map(|keys| vec![keys.public_key().to_bech32().unwrap()])
            .unwrap_or_default(),
        database_url,
        log_level: tracing::Level::INFO,
        log_dir: None,
    };

    let (state, _channels) = ServiceState::from_config(&config).await.unwrap();
    (state, dir)
}

fn responder_for(state: &ServiceState, peer: PublicKey) -> Responder {
    let keys = state.admin_keys().clone();
    Responder::new(Client::new(&keys), keys, peer, Cipher::Nip04)
}

#[tokio::test]
async fn non_admin_rpc_is_rejected_without_writes() {
    let stranger = Keys::generate();
    let (state, _dir) = setup_state(None).await;
    let responder = responder_for(&state, stranger.public_key());

    let request = Request::new("1", "create_new_key", vec!["sneaky".to_string()]);
    let response = rpc::handle_rpc(&state, &responder, stranger.public_key(), &request).await;
    assert_eq!(response.result, "error");
    assert_eq!(response.error.as_deref(), Some("unauthorized"));

    // nothing landed in the store or the vault
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM keys")
        .fetch_one(&**state.database())
        .await
        .unwrap();
    assert_eq!(count, 0);
    assert!(state.app_config().await.keys.is_empty());
}

#[tokio::test]
async fn whitelisted_admin_passes_the_gate() {
    let admin = Keys::generate();
    let (state, _dir) = setup_state(Some(&admin)).await;
    let responder = responder_for(&state, admin.public_key());

    let request = Request::new("1", "ping", vec![]);
    let response = rpc::handle_rpc(&state, &responder, admin.public_key(), &request).await;
    assert_eq!(response.result, "pong");

    let request = Request::new("2", "create_new_key", vec!["steve".to_string()]);
    let response = rpc::handle_rpc(&state, &responder, admin.public_key(), &request).await;
    assert_ne!(response.result, "error");
    assert!(state.app_config().await.keys.contains_key("steve"));
}
