//! Inbound HTTP boundary: provider redirect landings, authorize-URL
//! resolution, and gateway event ingest.
//!
//! Responses are plain text with HTTP-convention status codes: 404 when a
//! correlation token is not pending, 400 for malformed or ineligible
//! requests, 500 for internal or provider failures.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Form, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use warden_link::{CodeHostLinkService, DirectoryLinkService, LinkError};
use warden_ui::{CallbackRegistry, GatewayEvent};

#[derive(Clone)]
/// Shared state handed to every handler.
pub struct AppState {
    pub directory: Arc<DirectoryLinkService>,
    pub code_host: Arc<CodeHostLinkService>,
    pub registry: Arc<CallbackRegistry>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_info).post(directory_landing))
        .route("/directory/start", get(directory_start))
        .route("/code-host/callback", get(code_host_landing))
        .route("/gateway/event", post(gateway_event))
        .with_state(state)
}

/// Binds `listen_addr` and serves until the shutdown channel flips.
pub async fn run_server(
    listen_addr: SocketAddr,
    router: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    tracing::info!(%listen_addr, "listening for provider redirects and gateway events");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
        })
        .await
        .context("http server failed")
}

fn link_response(result: std::result::Result<String, LinkError>) -> Response {
    match result {
        Ok(message) => (StatusCode::OK, message).into_response(),
        Err(error) => {
            let status = StatusCode::from_u16(error.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if matches!(error, LinkError::Provider(_) | LinkError::Internal(_)) {
                tracing::error!(
                    %error,
                    detail = error.detail().unwrap_or_default(),
                    "linking request failed"
                );
            }
            (status, error.to_string()).into_response()
        }
    }
}

async fn root_info() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        "Hello! This endpoint receives provider redirects for the community bot.",
    )
        .into_response()
}

async fn directory_landing(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    link_response(state.directory.complete_link(&params).await)
}

async fn directory_start(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(token) = params.get("state").filter(|token| !token.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            "Invalid request, try running /directory verify again",
        )
            .into_response();
    };
    match state.directory.resolve_authorize_url(token) {
        Ok(Some(url)) => Redirect::to(&url).into_response(),
        Ok(None) => (
            StatusCode::BAD_REQUEST,
            "Invalid request, try running /directory verify again",
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "failed to resolve authorize url");
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

async fn code_host_landing(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    link_response(state.code_host.complete_link(&params).await)
}

/// Gateway event ingest: the chat platform's view of messages, components,
/// interactions, and joins enters the core here, in arrival order.
async fn gateway_event(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let event: GatewayEvent = match serde_json::from_value(body) {
        Ok(event) => event,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, format!("malformed gateway event: {error}"))
                .into_response();
        }
    };

    if let GatewayEvent::MemberJoined { user_id } = &event {
        if let Err(error) = state.directory.handle_member_joined(user_id).await {
            tracing::warn!(%error, user = %user_id, "failed to invite newcomer");
        }
        return (StatusCode::ACCEPTED, "accepted").into_response();
    }

    // Handler failures abort this event's processing only.
    if let Err(error) = state.registry.handle_event(&event).await {
        tracing::error!(%error, "gateway event handling failed");
    }
    (StatusCode::ACCEPTED, "accepted").into_response()
}

#[cfg(test)]
mod tests;
