//! Policy store behavior: token redemption and pending-request
//! lifecycle.

mod common;

use time::{Duration, OffsetDateTime};

use bunker_daemon::database::models::{
    KeyUser, PendingRequest, Policy, RequestStatus, SigningCondition, Token,
    TokenRedemptionError,
};

#[tokio::test]
async fn token_redemption_mints_grants_once() {
    let (db, _dir) = common::setup_db().await;
    let client = common::client_pubkey(1);

    let policy = Policy::create("signer", None, None, None, &db).await.unwrap();
    Policy::add_rule(policy.id, "sign_event", Some("1"), Some(5), &db)
        .await
        .unwrap();
    Token::create("aa11", "steve", "my app", policy.id, None, None, &db)
        .await
        .unwrap();

    let key_user = Token::redeem("aa11", &client, &db).await.unwrap();
    assert_eq!(key_user.key_name, "steve");
    assert_eq!(key_user.user_pubkey, client);

    let conditions = SigningCondition::list_for_key_user(key_user.id, &db)
        .await
        .unwrap();
    assert_eq!(conditions.len(), 2);
    assert!(conditions
        .iter()
        .any(|c| c.method.as_deref() == Some("connect") && c.allowed == Some(true)));
    assert!(conditions
        .iter()
        .any(|c| c.method.as_deref() == Some("sign_event") && c.kind.as_deref() == Some("1")));

    // one-shot: a second client cannot redeem the same token, and no
    // new conditions appear
    let other = common::client_pubkey(2);
    let err = Token::redeem("aa11", &other, &db).await.unwrap_err();
    assert!(matches!(err, TokenRedemptionError::AlreadyRedeemed));
    assert!(KeyUser::find("steve", &other, &db).await.unwrap().is_none());
}

#[tokio::test]
async fn token_unknown_and_expired_and_orphaned() {
    let (db, _dir) = common::setup_db().await;
    let client = common::client_pubkey(1);

    assert!(matches!(
        Token::redeem("missing", &client, &db).await.unwrap_err(),
        TokenRedemptionError::TokenNotFound
    ));

    let policy = Policy::create("p", None, None, None, &db).await.unwrap();
    let past = OffsetDateTime::now_utc() - Duration::hours(1);
    Token::create("bb22", "k", "app", policy.id, None, Some(past), &db)
        .await
        .unwrap();
    assert!(matches!(
        Token::redeem("bb22", &client, &db).await.unwrap_err(),
        TokenRedemptionError::Expired
    ));

    // a token whose policy was deleted is not redeemable
    Token::create("cc33", "k", "app", policy.id, None, None, &db)
        .await
        .unwrap();
    sqlx::query("DELETE FROM policies WHERE id = ?1")
        .bind(policy.id)
        .execute(&*db)
        .await
        .unwrap();
    assert!(matches!(
        Token::redeem("cc33", &client, &db).await.unwrap_err(),
        TokenRedemptionError::PolicyMissing
    ));
}

#[tokio::test]
async fn pending_request_decides_exactly_once() {
    let (db, _dir) = common::setup_db().await;
    let params = vec!["{\"kind\":1}".to_string()];

    let row = PendingRequest::create("req-1", Some("steve"), &common::client_pubkey(1), "sign_event", &params, &db)
        .await
        .unwrap();
    assert!(row.allowed.is_none());
    assert!(row.ttl_seconds() > 0 && row.ttl_seconds() <= 60);

    assert!(PendingRequest::decide(&row.id, true, None, &db).await.unwrap());
    // second decision is a no-op
    assert!(!PendingRequest::decide(&row.id, false, None, &db).await.unwrap());

    let row = PendingRequest::get(&row.id, &db).await.unwrap().unwrap();
    assert_eq!(row.allowed, Some(true));
}

#[tokio::test]
async fn pending_request_reap_signals_only_undecided() {
    let (db, _dir) = common::setup_db().await;
    let params = vec![];

    let undecided =
        PendingRequest::create("r1", None, &common::client_pubkey(1), "connect", &params, &db)
            .await
            .unwrap();
    let decided =
        PendingRequest::create("r2", None, &common::client_pubkey(1), "connect", &params, &db)
            .await
            .unwrap();
    PendingRequest::decide(&decided.id, true, None, &db).await.unwrap();

    // reaping an undecided row is the expiry signal
    assert!(PendingRequest::reap(&undecided.id, &db).await.unwrap());
    // reaping a decided row removes it quietly
    assert!(!PendingRequest::reap(&decided.id, &db).await.unwrap());

    assert!(PendingRequest::get(&undecided.id, &db).await.unwrap().is_none());
    assert!(PendingRequest::get(&decided.id, &db).await.unwrap().is_none());

    // reap is idempotent on a missing row
    assert!(!PendingRequest::reap(&undecided.id, &db).await.unwrap());
}

#[tokio::test]
async fn pending_request_status_listing() {
    let (db, _dir) = common::setup_db().await;
    let params = vec![];
    let client = common::client_pubkey(1);

    let pending = PendingRequest::create("r1", None, &client, "connect", &params, &db)
        .await
        .unwrap();
    let approved = PendingRequest::create("r2", None, &client, "connect", &params, &db)
        .await
        .unwrap();
    PendingRequest::decide(&approved.id, true, None, &db).await.unwrap();

    // age a third row past the TTL to make it expired
    let expired = PendingRequest::create("r3", None, &client, "connect", &params, &db)
        .await
        .unwrap();
    let old = OffsetDateTime::now_utc() - Duration::seconds(120);
    sqlx::query("UPDATE pending_requests SET created_at = ?1 WHERE id = ?2")
        .bind(old)
        .bind(&expired.id)
        .execute(&*db)
        .await
        .unwrap();

    let rows = PendingRequest::list(Some(RequestStatus::Pending), 50, 0, &db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, pending.id);

    let rows = PendingRequest::list(Some(RequestStatus::Approved), 50, 0, &db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, approved.id);

    let rows = PendingRequest::list(Some(RequestStatus::Expired), 50, 0, &db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, expired.id);
    assert_eq!(rows[0].ttl_seconds(), 0);

    assert_eq!(PendingRequest::count_pending(&db).await.unwrap(), 1);
}
