use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::connection::{self, ConnectionSettings};
use crate::hub::HubHandle;
use crate::protocol::UserId;
use crate::session::CallSession;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub verifier: Arc<TokenVerifier>,
    pub connection: ConnectionSettings,
    pub max_frame_bytes: usize,
}

impl AppState {
    pub fn new(config: &Config, hub: HubHandle) -> Self {
        Self {
            hub,
            verifier: Arc::new(TokenVerifier::new(&config.jwt_secret)),
            connection: config.connection(),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/presence/{user_id}", get(presence))
        .route("/calls/active", get(active_call))
        .route("/calls/{call_id}", get(call_by_id))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PairParams {
    a: UserId,
    b: UserId,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    // Browsers cannot set headers on an upgrade, so the query string wins
    let token = params.token.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    let identity = match state.verifier.verify(token.as_deref().unwrap_or_default()) {
        Ok(identity) => identity,
        Err(err) => {
            debug!(error = %err, "rejecting upgrade");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let hub = state.hub.clone();
    let settings = state.connection;
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| connection::serve(socket, identity, hub, settings))
}

async fn presence(State(state): State<AppState>, Path(user_id): Path<UserId>) -> impl IntoResponse {
    let connected = state.hub.is_connected(user_id).await;
    Json(json!({ "user_id": user_id, "connected": connected }))
}

async fn active_call(State(state): State<AppState>, Query(pair): Query<PairParams>) -> Result<Json<CallSession>, StatusCode> {
    state.hub.active_call_for(pair.a, pair.b).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn call_by_id(State(state): State<AppState>, Path(call_id): Path<String>) -> Result<Json<CallSession>, StatusCode> {
    state.hub.session(&call_id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let stats = state.hub.stats().await.ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(json!({
        "status": "ok",
        "connections": stats.connections,
        "live_calls": stats.live_calls,
    })))
}
