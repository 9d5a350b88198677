//! HTML approval pages.
//!
//! `GET /requests/:id` renders either the request-approval form or,
//! for `create_account`, the registration form. Both post back to the
//! JSON endpoints.

use askama::Template;
use askama_axum::IntoResponse;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};

use crate::app_config::StoredKey;
use crate::database::models::PendingRequest;
use crate::state::State as ServiceState;

#[derive(Template)]
#[template(path = "pages/request.html")]
pub struct ApprovalTemplate {
    pub id: String,
    pub method: String,
    pub key_name: String,
    pub remote_pubkey: String,
    pub params_pretty: String,
    pub needs_password: bool,
    pub ttl_seconds: i64,
}

#[derive(Template)]
#[template(path = "pages/register.html")]
pub struct RegisterTemplate {
    pub id: String,
    pub username: String,
    pub domain: String,
    pub email: String,
    pub domains: Vec<String>,
}

pub async fn approval_page(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> askama_axum::Response {
    let row = match PendingRequest::get(&id, state.database()).await {
        Ok(Some(row)) => row,
        Ok(None) => return plain_page(StatusCode::NOT_FOUND, "request not found or expired"),
        Err(e) => {
            tracing::error!("failed to load pending request: {}", e);
            return plain_page(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let params = row.params_vec();

    if row.method == "create_account" {
        let config = state.app_config().await;
        return RegisterTemplate {
            id: row.id,
            username: params.first().cloned().unwrap_or_default(),
            domain: params.get(1).cloned().unwrap_or_default(),
            email: params.get(2).cloned().unwrap_or_default(),
            domains: config.domains.keys().cloned().collect(),
        }
        .into_response();
    }

    let needs_password = match &row.key_name {
        Some(key_name) => matches!(
            state.stored_key(key_name).await,
            Some(StoredKey::Encrypted(_))
        ),
        None => false,
    };

    ApprovalTemplate {
        id: row.id.clone(),
        method: row.method.clone(),
        key_name: row.key_name.clone().unwrap_or_default(),
        remote_pubkey: row.remote_pubkey.clone(),
        params_pretty: serde_json::to_string_pretty(&params).unwrap_or_default(),
        needs_password,
        ttl_seconds: row.ttl_seconds(),
    }
    .into_response()
}

fn plain_page(status: StatusCode, message: &str) -> askama_axum::Response {
    axum::http::Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(format!(
            "<!doctype html><html><body><p>{}</p></body></html>",
            message
        )))
        .expect("static response builds")
}
