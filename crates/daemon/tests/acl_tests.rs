//! ACL evaluation: grants, vetoes, revocation, kind scoping.

mod common;

use bunker_daemon::acl::{self, Decision};
use bunker_daemon::database::models::{KeyUser, SigningCondition};

const KEY: &str = "steve";

fn event_param(kind: u64) -> String {
    format!("{{\"kind\":{},\"content\":\"hi\",\"tags\":[]}}", kind)
}

#[tokio::test]
async fn unknown_without_key_user() {
    let (db, _dir) = common::setup_db().await;
    let decision = acl::evaluate(KEY, &common::client_pubkey(1), "sign_event", None, &db)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Unknown);
}

#[tokio::test]
async fn grant_is_monotonic_until_revoked() {
    let (db, _dir) = common::setup_db().await;
    let client = common::client_pubkey(1);

    acl::permit_all_requests(KEY, &client, "sign_event", Some("all"), None, &db)
        .await
        .unwrap();

    for _ in 0..3 {
        let decision = acl::evaluate(KEY, &client, "sign_event", Some(&event_param(1)), &db)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    // the blanket scope is stored as the exact string "all"
    let key_user = KeyUser::find(KEY, &client, &db).await.unwrap().unwrap();
    let conditions = SigningCondition::list_for_key_user(key_user.id, &db)
        .await
        .unwrap();
    assert_eq!(conditions[0].kind.as_deref(), Some("all"));

    KeyUser::revoke(key_user.id, &db).await.unwrap();
    let decision = acl::evaluate(KEY, &client, "sign_event", Some(&event_param(1)), &db)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Deny);
}

#[tokio::test]
async fn wildcard_veto_beats_everything() {
    let (db, _dir) = common::setup_db().await;
    let client = common::client_pubkey(1);

    acl::permit_all_requests(KEY, &client, "sign_event", Some("all"), None, &db)
        .await
        .unwrap();
    acl::permit_all_requests(KEY, &client, "connect", None, None, &db)
        .await
        .unwrap();
    acl::reject_all_requests(KEY, &client, None, &db).await.unwrap();

    // every method is denied, including ones never mentioned
    for method in ["sign_event", "connect", "get_public_key", "nip04_encrypt"] {
        let decision = acl::evaluate(KEY, &client, method, None, &db).await.unwrap();
        assert_eq!(decision, Decision::Deny, "method {}", method);
    }
}

#[tokio::test]
async fn sign_event_kind_scoping() {
    let (db, _dir) = common::setup_db().await;
    let client = common::client_pubkey(1);

    acl::permit_all_requests(KEY, &client, "sign_event", Some("1"), None, &db)
        .await
        .unwrap();

    let allowed = acl::evaluate(KEY, &client, "sign_event", Some(&event_param(1)), &db)
        .await
        .unwrap();
    assert_eq!(allowed, Decision::Allow);

    // a different kind falls through to unknown, not deny
    let other = acl::evaluate(KEY, &client, "sign_event", Some(&event_param(4)), &db)
        .await
        .unwrap();
    assert_eq!(other, Decision::Unknown);

    // an unparseable event only matches the blanket scope
    let garbled = acl::evaluate(KEY, &client, "sign_event", Some("not json"), &db)
        .await
        .unwrap();
    assert_eq!(garbled, Decision::Unknown);

    acl::permit_all_requests(KEY, &client, "sign_event", Some("all"), None, &db)
        .await
        .unwrap();
    let any = acl::evaluate(KEY, &client, "sign_event", Some(&event_param(30023)), &db)
        .await
        .unwrap();
    assert_eq!(any, Decision::Allow);
}

#[tokio::test]
async fn other_methods_ignore_kind_filter() {
    let (db, _dir) = common::setup_db().await;
    let client = common::client_pubkey(1);

    acl::permit_all_requests(KEY, &client, "nip04_encrypt", None, None, &db)
        .await
        .unwrap();

    let decision = acl::evaluate(KEY, &client, "nip04_encrypt", Some("some pubkey"), &db)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Allow);

    // the grant is method-scoped; other methods stay unknown
    let decision = acl::evaluate(KEY, &client, "nip04_decrypt", None, &db)
        .await
        .unwrap();
    assert_eq!(decision, Decision::Unknown);
}

#[tokio::test]
async fn regrant_after_revocation_restores_access() {
    let (db, _dir) = common::setup_db().await;
    let client = common::client_pubkey(1);

    acl::permit_all_requests(KEY, &client, "connect", None, None, &db)
        .await
        .unwrap();
    let key_user = KeyUser::find(KEY, &client, &db).await.unwrap().unwrap();
    KeyUser::revoke(key_user.id, &db).await.unwrap();
    assert_eq!(
        acl::evaluate(KEY, &client, "connect", None, &db).await.unwrap(),
        Decision::Deny
    );

    // an explicit new grant lifts the revocation
    acl::permit_all_requests(KEY, &client, "connect", None, None, &db)
        .await
        .unwrap();
    assert_eq!(
        acl::evaluate(KEY, &client, "connect", None, &db).await.unwrap(),
        Decision::Allow
    );
}
