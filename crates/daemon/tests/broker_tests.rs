//! Authorization broker: waiter wake-ups, expiry, and the relay admin
//! fallback.

mod common;

use tokio::sync::mpsc;

use bunker_daemon::acl::{self, Decision};
use bunker_daemon::broker::{Broker, BrokerError, Verdict};
use bunker_daemon::database::models::PendingRequest;

#[tokio::test]
async fn http_approval_wakes_waiter_with_rewritten_params() {
    let (db, _dir) = common::setup_db().await;
    let (acl_tx, _acl_rx) = mpsc::unbounded_channel();
    let broker = Broker::new(db.clone(), Some("https://bunker.example".to_string()), acl_tx);
    let client = common::client_pubkey(1);

    let params = vec!["alice".to_string(), "example.com".to_string(), String::new()];
    let ticket = broker
        .open(None, "req-1", &client, "create_account", &params)
        .await
        .unwrap();
    let url = ticket.auth_url.clone().unwrap();
    assert_eq!(
        url,
        format!("https://bunker.example/requests/{}", ticket.pending_id)
    );

    // the admin's form rewrites the username before approving
    let pending_id = ticket.pending_id.clone();
    let rewritten = vec!["bob".to_string(), "example.com".to_string(), String::new()];
    let approver_db = db.clone();
    let approver_broker = broker.clone();
    let approver_params = rewritten.clone();
    tokio::spawn(async move {
        PendingRequest::decide(&pending_id, true, Some(&approver_params), &approver_db)
            .await
            .unwrap();
        approver_broker.resolve(&pending_id, Verdict::Approved).await;
    });

    let approved = broker.wait(ticket).await.unwrap();
    assert_eq!(approved, rewritten);
}

#[tokio::test]
async fn denial_and_expiry_reject_the_waiter() {
    let (db, _dir) = common::setup_db().await;
    let (acl_tx, _acl_rx) = mpsc::unbounded_channel();
    let broker = Broker::new(db.clone(), Some("https://bunker.example".to_string()), acl_tx);
    let client = common::client_pubkey(1);

    let ticket = broker
        .open(Some("steve"), "req-1", &client, "sign_event", &[])
        .await
        .unwrap();
    let pending_id = ticket.pending_id.clone();
    let deny_broker = broker.clone();
    tokio::spawn(async move {
        deny_broker.resolve(&pending_id, Verdict::Denied).await;
    });
    assert!(matches!(
        broker.wait(ticket).await,
        Err(BrokerError::Denied)
    ));

    // the reaper path: expiry removes the row and denies the waiter
    let ticket = broker
        .open(Some("steve"), "req-2", &client, "sign_event", &[])
        .await
        .unwrap();
    let pending_id = ticket.pending_id.clone();
    let reaper_broker = broker.clone();
    tokio::spawn(async move {
        reaper_broker.expire(&pending_id).await;
    });
    let result = broker.wait(ticket).await;
    assert!(matches!(result, Err(BrokerError::Denied)));
}

#[tokio::test]
async fn admin_always_persists_a_grant() {
    let (db, _dir) = common::setup_db().await;
    let (acl_tx, mut acl_rx) = mpsc::unbounded_channel();
    let broker = Broker::new(db.clone(), None, acl_tx);
    let client = common::client_pubkey(1);

    // a stub admin that always answers "always"
    tokio::spawn(async move {
        while let Some(query) = acl_rx.recv().await {
            let _ = query.reply.send("always".to_string());
        }
    });

    let params = vec!["{\"kind\":1}".to_string()];
    let ticket = broker
        .open(Some("steve"), "req-1", &client, "sign_event", &params)
        .await
        .unwrap();
    assert!(ticket.auth_url.is_none());

    let approved = broker
        .ask_admins(ticket, Some("steve"), &client, "sign_event", &params, None)
        .await
        .unwrap();
    assert_eq!(approved, params);

    // the grant survives; the next request takes the fast path
    let decision = acl::evaluate("steve", &client, "sign_event", Some(&params[0]), &db)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Allow);
}

#[tokio::test]
async fn admin_never_writes_the_veto() {
    let (db, _dir) = common::setup_db().await;
    let (acl_tx, mut acl_rx) = mpsc::unbounded_channel();
    let broker = Broker::new(db.clone(), None, acl_tx);
    let client = common::client_pubkey(1);

    tokio::spawn(async move {
        while let Some(query) = acl_rx.recv().await {
            let _ = query.reply.send("never".to_string());
        }
    });

    let ticket = broker
        .open(Some("steve"), "req-1", &client, "sign_event", &[])
        .await
        .unwrap();
    let result = broker
        .ask_admins(ticket, Some("steve"), &client, "sign_event", &[], None)
        .await;
    assert!(matches!(result, Err(BrokerError::Denied)));

    // the veto catches unrelated methods too
    let decision = acl::evaluate("steve", &client, "get_public_key", None, &db)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Deny);
}

#[tokio::test]
async fn transient_allow_persists_nothing() {
    let (db, _dir) = common::setup_db().await;
    let (acl_tx, mut acl_rx) = mpsc::unbounded_channel();
    let broker = Broker::new(db.clone(), None, acl_tx);
    let client = common::client_pubkey(1);

    tokio::spawn(async move {
        while let Some(query) = acl_rx.recv().await {
            let _ = query.reply.send("allow".to_string());
        }
    });

    let ticket = broker
        .open(Some("steve"), "req-1", &client, "get_public_key", &[])
        .await
        .unwrap();
    let approved = broker
        .ask_admins(ticket, Some("steve"), &client, "get_public_key", &[], None)
        .await
        .unwrap();
    assert!(approved.is_empty());

    // no condition was written; the next request asks again
    let decision = acl::evaluate("steve", &client, "get_public_key", None, &db)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Unknown);
}
