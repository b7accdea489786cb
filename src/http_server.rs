//! HTTP and WebSocket surface using Axum.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{
        header::{CACHE_CONTROL, COOKIE, SET_COOKIE},
        HeaderMap, StatusCode,
    },
    response::{AppendHeaders, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::connection::{Connection, Frame};
use crate::state::AppState;

const SESSION_COOKIE: &str = "session";
const IDENTITY_COOKIE: &str = "identity";
const CLIENT_ID_COOKIE: &str = "gcid";
const COOKIE_MAX_AGE_SECS: u64 = 3600 * 24 * 30;
const NO_CACHE: &str = "no-cache, no-store, max-age=0, must-revalidate";
/// Shorter document names are rejected.
pub const MIN_ROOM_NAME_LEN: usize = 4;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/room/new", get(new_room))
        .route("/doc/:name", get(doc_socket))
        .route("/auth/login", post(login))
        .route("/auth/logout", get(logout).post(logout))
        .route("/auth/query", get(query))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Starting HTTP server on {}", addr);
    }
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "OK"
}

async fn new_room(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let room = state.rooms.with_unique_name().await;
    let session = cookie(&headers, SESSION_COOKIE)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(room = room.name(), "created room");
    (
        AppendHeaders([
            (SET_COOKIE, set_cookie(CLIENT_ID_COOKIE, &state.client_id)),
            (SET_COOKIE, set_cookie(SESSION_COOKIE, &session)),
        ]),
        room.name().to_string(),
    )
        .into_response()
}

async fn doc_socket(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let Some(session) = cookie(&headers, SESSION_COOKIE) else {
        return (StatusCode::UNAUTHORIZED, "missing session").into_response();
    };
    if name.chars().count() < MIN_ROOM_NAME_LEN {
        return (StatusCode::NOT_FOUND, "Room names must be at least 4 letters long.").into_response();
    }
    let identity = cookie(&headers, IDENTITY_COOKIE);
    ws.on_upgrade(move |socket| handle_doc_socket(socket, state, name, session, identity))
}

async fn handle_doc_socket(
    socket: WebSocket,
    state: AppState,
    name: String,
    session: String,
    identity: Option<String>,
) {
    let (conn, mut outbound) = Connection::open();
    let auth = Arc::new(state.auth_liveness());
    if let Some(token) = identity.as_deref() {
        auth.heartbeat(token);
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(bytes) => Message::Binary(bytes),
                Frame::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // A room that shut down between lookup and join is replaced on the next lookup.
    let room = loop {
        let room = state.rooms.by_name(&name);
        match room.connect(conn.clone(), session.clone(), Arc::clone(&auth)).await {
            Ok(true) => break room,
            Ok(false) => return,
            Err(err) => debug!(%err, "retrying join"),
        }
    };

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if room.inbound(conn.id(), text).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(bytes)) => state.docs().receive(&name, conn.id(), &bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(conn = %conn.id(), %err, "socket error");
                break;
            }
        }
    }
    room.disconnect(conn.id());
}

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    token: Option<String>,
}

async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> Response {
    let Some(token) = request.token.filter(|token| !token.is_empty()) else {
        return logout().await;
    };
    match state.users.from_token(state.verifier.as_ref(), &token).await {
        Ok(Some(user)) => (
            AppendHeaders([
                (SET_COOKIE, set_cookie(IDENTITY_COOKIE, &user.uuid)),
                (CACHE_CONTROL, NO_CACHE.to_string()),
            ]),
            Json(user.public()),
        )
            .into_response(),
        Ok(None) => logout().await,
        Err(err) => {
            error!(%err, "failed to store user");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn logout() -> Response {
    (
        AppendHeaders([
            (SET_COOKIE, clear_cookie(IDENTITY_COOKIE)),
            (CACHE_CONTROL, NO_CACHE.to_string()),
        ]),
        Json(serde_json::Value::Null),
    )
        .into_response()
}

async fn query(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = cookie(&headers, IDENTITY_COOKIE).and_then(|uuid| state.users.by_uuid(&uuid));
    match user {
        Some(user) => (
            AppendHeaders([(CACHE_CONTROL, NO_CACHE.to_string())]),
            Json(user.public()),
        )
            .into_response(),
        None => logout().await,
    }
}

fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

fn set_cookie(name: &str, value: &str) -> String {
    format!("{name}={value}; SameSite=Strict; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}")
}

fn clear_cookie(name: &str) -> String {
    format!("{name}=FALSE; SameSite=Strict; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT")
}
