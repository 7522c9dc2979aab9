use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{FutureExt, sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::protocol::Identity;
use crate::registry::{ChannelHandle, Frame};
use crate::router::{Delivery, SignalRouter};

/// Per-socket transport limits.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub ping_interval: Duration,
    pub outbound_buffer: usize,
    /// Hard cap enforced while reading; a bigger frame ends the connection.
    /// Keep it above the router's message limit so oversized signals are
    /// dropped instead.
    pub max_frame_bytes: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            outbound_buffer: 64,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    router: Arc<SignalRouter>,
    settings: ChannelSettings,
}

impl AppState {
    pub fn new(router: Arc<SignalRouter>, settings: ChannelSettings) -> Self {
        Self { router, settings }
    }

    pub fn from_config(config: &Config) -> Self {
        let verifier = JwtVerifier::new(&config.jwt_secret, config.jwt_leeway());
        let router = SignalRouter::new(Arc::new(verifier), config.hangup_notice)
            .with_max_message_bytes(config.max_message_bytes);
        Self::new(
            Arc::new(router),
            ChannelSettings {
                ping_interval: config.ping_interval(),
                outbound_buffer: config.outbound_buffer,
                max_frame_bytes: config.max_frame_bytes.max(config.max_message_bytes),
            },
        )
    }

    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    Bearer,
    Query,
    Subprotocol,
}

/// Find the credential on a channel-open request. Browsers cannot set
/// headers on a WebSocket, so they pass it as the subprotocol instead.
fn extract_token(headers: &HeaderMap, params: &HandshakeParams) -> Option<(String, TokenSource)> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some((token.to_owned(), TokenSource::Bearer));
    }

    if let Some(token) = params.token.as_deref().filter(|t| !t.is_empty()) {
        return Some((token.to_owned(), TokenSource::Query));
    }

    first_subprotocol(headers).map(|t| (t.to_owned(), TokenSource::Subprotocol))
}

fn first_subprotocol(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HandshakeParams>,
    State(state): State<AppState>,
) -> Response {
    let Some((token, source)) = extract_token(&headers, &params) else {
        warn!("handshake rejected: no credential");
        return (StatusCode::UNAUTHORIZED, "missing credential").into_response();
    };

    let identity = match state.router.authenticate(&token) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "handshake rejected");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };
    debug!(identity = %identity, source = ?source, "handshake accepted");

    // Browsers abort the handshake unless one offered protocol is echoed,
    // whichever way the token arrived.
    let mut ws = ws.max_message_size(state.settings.max_frame_bytes);
    if let Some(offered) = first_subprotocol(&headers) {
        ws = ws.protocols([offered.to_owned()]);
    }

    ws.on_failed_upgrade(|err: axum::Error| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, identity, state))
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (channel, mut rx) = ChannelHandle::new(state.settings.outbound_buffer);
    let (mut conn, displaced) = state.router.open(identity, channel);

    if let Some(old) = displaced {
        old.close("replaced");
    }

    // Task 1: drain the channel into the socket, with keepalive pings
    let ping_every = state.settings.ping_interval;
    let mut close_requested = conn.channel().close_requested();
    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = time::interval_at(Instant::now() + ping_every, ping_every);
        loop {
            tokio::select! {
                _ = close_requested.wait_for(Option::is_some).map(|_| ()) => {
                    let reason = *close_requested.borrow();
                    if let Some(reason) = reason {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: reason.into(),
                            })))
                            .await;
                    }
                    break;
                }
                frame = rx.recv() => match frame {
                    Some(Frame(text)) => {
                        if sender.send(Message::Text(text.into())).await.is_err() { break; }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() { break; }
                }
            }
        }
    });

    // Task 2: route inbound frames in arrival order
    let mut writer_done = false;
    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Delivery::Superseded = state.router.route(&mut conn, text.as_str()) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(identity = %conn.identity(), error = %err, "websocket read failed");
                    break;
                }
            },
            _ = &mut send_task => {
                writer_done = true;
                break;
            }
        }
    }

    let replaced = conn.channel().close_requested().borrow().is_some();
    state.router.close(conn);
    if replaced && !writer_done {
        // Let the writer deliver its close frame before tearing down.
        let _ = time::timeout(Duration::from_secs(1), &mut send_task).await;
    }
    send_task.abort();
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "online": state.router.registry().len(),
    }))
}
