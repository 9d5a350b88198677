//! Request authorization against the policy store.
//!
//! Evaluation is a pure function of store state. The wildcard veto row
//! (`method = '*', allowed = false`) is the single always-consulted
//! check; everything else is scoped to the request's method and, for
//! `sign_event`, to the event kind. Blanket approvals are stored with
//! the exact string `kind = "all"` so they compose with per-kind rows.

use crate::database::models::{KeyUser, SigningCondition};
use crate::database::Database;

/// Outcome of consulting the store for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// No applicable condition; the authorization broker takes over.
    Unknown,
}

/// Decide whether `client_pubkey` may perform `method` against
/// `key_name`.
///
/// `param_primary` is the request's first positional parameter; it is
/// only inspected for `sign_event`, where an embedded numeric `kind`
/// widens the lookup from the blanket `"all"` scope to the specific
/// kind as well.
pub async fn evaluate(
    key_name: &str,
    client_pubkey: &str,
    method: &str,
    param_primary: Option<&str>,
    db: &Database,
) -> Result<Decision, sqlx::Error> {
    let key_user = match KeyUser::find(key_name, client_pubkey, db).await? {
        Some(key_user) => key_user,
        None => return Ok(Decision::Unknown),
    };

    if SigningCondition::has_wildcard_deny(key_user.id, db).await? {
        return Ok(Decision::Deny);
    }

    let kinds = kind_set(method, param_primary);
    let matches =
        SigningCondition::find_matches(key_user.id, method, kinds.as_deref(), db).await?;

    if matches.iter().any(|c| c.allowed == Some(false)) {
        return Ok(Decision::Deny);
    }
    if matches.iter().any(|c| c.allowed == Some(true)) {
        // a revoked key-user keeps its rows but loses its grants
        if key_user.is_revoked() {
            return Ok(Decision::Deny);
        }
        return Ok(Decision::Allow);
    }

    Ok(Decision::Unknown)
}

/// The kind scopes a `sign_event` request matches against: always
/// `"all"`, plus the event's own kind when the first parameter parses
/// as an object with a numeric `kind`. Other methods ignore kinds.
fn kind_set(method: &str, param_primary: Option<&str>) -> Option<Vec<String>> {
    if method != "sign_event" {
        return None;
    }

    let mut kinds = vec!["all".to_string()];
    if let Some(param) = param_primary {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(param) {
            if let Some(kind) = value.get("kind").and_then(|k| k.as_u64()) {
                kinds.push(kind.to_string());
            }
        }
    }
    Some(kinds)
}

/// Grant `method` to `(key_name, client_pubkey)`, creating the
/// key-user if needed and lifting any prior revocation.
///
/// For `sign_event` without a specific scope the condition is stored
/// with the literal string `kind = "all"`.
pub async fn permit_all_requests(
    key_name: &str,
    client_pubkey: &str,
    method: &str,
    kind_scope: Option<&str>,
    description: Option<&str>,
    db: &Database,
) -> Result<KeyUser, sqlx::Error> {
    let key_user = KeyUser::upsert(key_name, client_pubkey, description, db).await?;
    if key_user.is_revoked() {
        sqlx::query("UPDATE key_users SET revoked_at = NULL WHERE id = ?1")
            .bind(key_user.id)
            .execute(&**db)
            .await?;
    }

    let kind = match (method, kind_scope) {
        ("sign_event", Some(scope)) => Some(scope.to_string()),
        ("sign_event", None) => Some("all".to_string()),
        _ => None,
    };
    SigningCondition::insert(key_user.id, Some(method), kind.as_deref(), true, db).await?;

    KeyUser::get(key_user.id, db)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

/// Write the wildcard veto for `(key_name, client_pubkey)`: every
/// subsequent request from that client is denied until the row is
/// removed.
pub async fn reject_all_requests(
    key_name: &str,
    client_pubkey: &str,
    description: Option<&str>,
    db: &Database,
) -> Result<KeyUser, sqlx::Error> {
    let key_user = KeyUser::upsert(key_name, client_pubkey, description, db).await?;
    SigningCondition::insert(key_user.id, Some("*"), None, false, db).await?;
    Ok(key_user)
}
