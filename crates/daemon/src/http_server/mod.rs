pub mod api;
mod html;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse};
use tower_http::LatencyUnit;

use crate::state::State;

/// Run the approval and dashboard HTTP server.
pub async fn run(state: State, mut shutdown_rx: watch::Receiver<()>) -> Result<(), HttpServerError> {
    let listen_addr = state.listen_addr().await;

    let trace_layer = TraceLayer::new_for_http()
        .on_response(
            DefaultOnResponse::new()
                .include_headers(false)
                .level(tracing::Level::INFO)
                .latency_unit(LatencyUnit::Micros),
        )
        .on_failure(DefaultOnFailure::new().latency_unit(LatencyUnit::Micros));

    // the dashboard may live on another origin, so reflect whatever
    // it sends and allow credentials
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_credentials(true);

    let router = Router::new()
        .route("/connection", get(api::connection::handler))
        .route("/requests", get(api::requests::list_handler))
        .route(
            "/requests/:id",
            get(html::approval_page).post(api::requests::approve_handler),
        )
        .route("/register/:id", axum::routing::post(api::register::handler))
        .route(
            "/keys",
            get(api::keys::list_handler).post(api::keys::create_handler),
        )
        .route("/apps", get(api::apps::list_handler))
        .route("/apps/:id", axum::routing::patch(api::apps::rename_handler))
        .route(
            "/apps/:id/revoke",
            axum::routing::post(api::apps::revoke_handler),
        )
        .route("/dashboard", get(api::dashboard::handler))
        .route("/_status/healthz", get(healthz))
        .fallback(not_found_handler)
        .layer(cors)
        .with_state(state)
        .layer(trace_layer);

    tracing::info!(addr = ?listen_addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

async fn healthz(axum::extract::State(state): axum::extract::State<State>) -> Response {
    match state.database().is_ready().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))).into_response(),
        Err(e) => {
            tracing::warn!("health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "failure"})),
            )
                .into_response()
        }
    }
}

async fn not_found_handler(headers: axum::http::HeaderMap) -> Response {
    let accept = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok());

    match accept {
        Some(accept_str) if accept_str.contains("application/json") => {
            let err_msg = serde_json::json!({"msg": "not found"});
            (StatusCode::NOT_FOUND, Json(err_msg)).into_response()
        }
        _ => (
            StatusCode::NOT_FOUND,
            [(axum::http::header::CONTENT_TYPE, "text/plain")],
            "not found",
        )
            .into_response(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    #[error("an error occurred running the HTTP server: {0}")]
    ServingFailed(#[from] std::io::Error),
}
