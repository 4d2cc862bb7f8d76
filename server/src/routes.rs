//! HTTP surface: the connection handshake endpoint and the delivery API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::conn::WsConn;
use crate::hub::DeliveryResult;
use crate::message::Message;
use crate::state::AppState;

/// WebSocket close codes for handshake failures:
/// 4001 = authentication rejected
/// 4002 = admission refused (capacity or invalid identity)
const CLOSE_AUTH_REJECTED: u16 = 4001;
const CLOSE_ADMISSION_REFUSED: u16 = 4002;

#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    pub service: String,
    pub username: String,
    #[serde(default)]
    pub token: String,
    /// Background side-channels connect with visible=false; their deliveries
    /// do not count as reaching the user.
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/send", post(send_message))
        .route("/services", get(list_services))
        .with_state(state)
}

/// GET /ws?service=S&username=U&token=T&visible=true
///
/// Authenticates via the auth webhook under the handshake timeout, then
/// upgrades and offers the connection to the hub. Failures upgrade anyway and
/// immediately close with a descriptive code, so the client sees the reason.
async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let addr = addr.to_string();
    match authenticate(&state, &params, &addr).await {
        Ok(true) => {
            tracing::info!(
                service = %params.service,
                username = %params.username,
                addr = %addr,
                "connection authenticated"
            );
            ws.on_upgrade(move |socket| handle_authenticated(socket, state, params, addr))
        }
        Ok(false) => {
            tracing::warn!(
                service = %params.service,
                username = %params.username,
                addr = %addr,
                "authentication rejected"
            );
            report_error(&state, &params.service, &params.username, &addr, "authentication rejected");
            ws.on_upgrade(move |socket| {
                close_with(socket, CLOSE_AUTH_REJECTED, "authentication rejected")
            })
        }
        Err(reason) => {
            tracing::warn!(
                service = %params.service,
                username = %params.username,
                addr = %addr,
                reason = %reason,
                "authentication failed"
            );
            report_error(&state, &params.service, &params.username, &addr, &reason);
            ws.on_upgrade(move |socket| close_with(socket, CLOSE_AUTH_REJECTED, "authentication failed"))
        }
    }
}

/// Run the auth webhook, bounded by the configured handshake timeout.
async fn authenticate(
    state: &AppState,
    params: &WsConnectQuery,
    addr: &str,
) -> Result<bool, String> {
    let fut = state
        .config
        .auth
        .authenticate(&params.service, &params.username, &params.token, addr);
    let result = if state.config.handshake_timeout > Duration::ZERO {
        match tokio::time::timeout(state.config.handshake_timeout, fut).await {
            Ok(result) => result,
            Err(_) => return Err("handshake timed out".to_string()),
        }
    } else {
        fut.await
    };
    result.map_err(|e| e.to_string())
}

async fn handle_authenticated(
    socket: WebSocket,
    state: AppState,
    params: WsConnectQuery,
    addr: String,
) {
    let conn = WsConn::new(socket, &params.service, &params.username, &addr, params.visible);
    if let Err(err) = state.hub.new_conn(conn.clone()).await {
        tracing::warn!(
            service = %params.service,
            username = %params.username,
            addr = %addr,
            error = %err,
            "connection refused"
        );
        report_error(&state, &params.service, &params.username, &addr, &err.to_string());
        conn.close_with(CLOSE_ADMISSION_REFUSED, &err.to_string());
    }
}

/// Send a close frame with the given code before dropping the socket.
async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Surface a pre-admission failure through the top-level error hook. The
/// connection id is empty: no connection was admitted.
fn report_error(state: &AppState, service: &str, username: &str, addr: &str, reason: &str) {
    if let Some(handler) = &state.config.error_handler {
        let handler = handler.clone();
        let service = service.to_string();
        let username = username.to_string();
        let addr = addr.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            handler.on_error(&service, &username, "", &addr, &reason).await;
        });
    }
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub service: String,
    pub username: String,
    pub msg: Message,
    #[serde(default)]
    pub extra: HashMap<String, String>,
    /// Cache TTL in seconds for the push-fallback path; 0 = no expiry.
    #[serde(default)]
    pub ttl: u64,
}

/// POST /send -- deliver a message to every live connection of a user.
/// Returns one result per connection at service time.
async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Json<Vec<DeliveryResult>> {
    let extra = if req.extra.is_empty() {
        None
    } else {
        Some(req.extra)
    };
    let results = state
        .hub
        .send_message(
            &req.service,
            &req.username,
            req.msg,
            extra,
            Duration::from_secs(req.ttl),
        )
        .await;
    Json(results)
}

/// GET /services -- names of the explicitly configured services.
async fn list_services(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.hub.all_services())
}
