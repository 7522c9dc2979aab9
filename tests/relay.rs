use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use signal_relay::auth::issue_token;
use signal_relay::{
    AppState, ChannelSettings, HangupNotice, Identity, JwtVerifier, SignalRouter, app,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const SECRET: &str = "integration-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> (String, AppState) {
    let verifier = JwtVerifier::new(SECRET, Duration::ZERO);
    let router = SignalRouter::new(Arc::new(verifier), HangupNotice::Peers);
    let state = AppState::new(Arc::new(router), ChannelSettings::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, service).await.unwrap();
    });

    (format!("ws://{addr}/"), state)
}

fn token_for(name: &str) -> String {
    issue_token(SECRET, &Identity::new(name).unwrap(), Duration::from_secs(60)).unwrap()
}

/// Connect with a bearer token and consume the `identified` greeting.
async fn connect(url: &str, name: &str) -> Client {
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", token_for(name))).unwrap(),
    );
    let (mut ws, _) = connect_async(request).await.unwrap();
    assert_eq!(recv_json(&mut ws).await, json!({"type": "identified", "id": name}));
    ws
}

async fn next_text(ws: &mut Client) -> Value {
    loop {
        let msg = ws.next().await.expect("stream ended").expect("websocket error");
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn recv_json(ws: &mut Client) -> Value {
    timeout(Duration::from_secs(2), next_text(ws))
        .await
        .expect("timed out waiting for a message")
}

async fn assert_silent(ws: &mut Client) {
    assert!(
        timeout(Duration::from_millis(300), next_text(ws)).await.is_err(),
        "expected no message"
    );
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn wait_until_offline(state: &AppState, name: &str) {
    let id = Identity::new(name).unwrap();
    timeout(Duration::from_secs(2), async {
        while state.router().registry().lookup(&id).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("identity was never unregistered");
}

fn assert_unauthorized(result: Result<impl Sized, tungstenite::Error>) {
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
        }
        Err(other) => panic!("expected HTTP 401, got {other}"),
        Ok(_) => panic!("handshake unexpectedly succeeded"),
    }
}

#[tokio::test]
async fn handshake_without_valid_credential_is_refused() {
    let (url, state) = spawn_relay().await;

    assert_unauthorized(connect_async(url.as_str()).await);

    let forged = issue_token("wrong-secret", &Identity::new("peer-A").unwrap(), Duration::from_secs(60))
        .unwrap();
    assert_unauthorized(connect_async(format!("{url}?token={forged}")).await);

    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", HeaderValue::from_static("Bearer not-a-token"));
    assert_unauthorized(connect_async(request).await);

    assert!(state.router().registry().is_empty());
}

#[tokio::test]
async fn token_in_subprotocol_is_echoed_back() {
    let (url, state) = spawn_relay().await;
    let token = token_for("peer-A");

    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_str(&token).unwrap(),
    );
    let (mut ws, response) = connect_async(request).await.unwrap();

    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some(token.as_str())
    );
    assert_eq!(recv_json(&mut ws).await, json!({"type": "identified", "id": "peer-A"}));
    assert_eq!(state.router().registry().len(), 1);
}

#[tokio::test]
async fn offered_subprotocol_is_echoed_when_token_comes_from_query() {
    let (url, _state) = spawn_relay().await;
    let token = token_for("peer-A");

    let mut request = format!("{url}?token={token}").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("chat"));
    let (mut ws, response) = connect_async(request).await.unwrap();

    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some("chat")
    );
    assert_eq!(recv_json(&mut ws).await, json!({"type": "identified", "id": "peer-A"}));
}

#[tokio::test]
async fn oversized_offer_is_dropped_without_disconnecting_sender() {
    let (url, state) = spawn_relay().await;
    let mut a = connect(&url, "peer-A").await;
    let mut b = connect(&url, "peer-B").await;

    send_json(
        &mut a,
        json!({"type": "offer", "recipientId": "peer-B", "callId": "c1", "offer": {"sdp": "v".repeat(70 * 1024)}}),
    )
    .await;
    send_json(
        &mut a,
        json!({"type": "call-request", "recipientId": "peer-B", "callId": "c1", "callType": "video"}),
    )
    .await;

    assert_eq!(
        recv_json(&mut b).await,
        json!({"type": "call-request", "senderId": "peer-A", "callId": "c1", "callType": "video"})
    );
    assert!(
        state
            .router()
            .registry()
            .lookup(&Identity::new("peer-A").unwrap())
            .is_some()
    );
}

#[tokio::test]
async fn call_request_reaches_callee_and_later_offer_is_dropped_after_disconnect() {
    let (url, state) = spawn_relay().await;
    let mut a = connect(&url, "peer-A").await;
    let mut b = connect(&url, "peer-B").await;

    send_json(
        &mut a,
        json!({"type": "call-request", "recipientId": "peer-B", "callId": "c1", "callType": "video"}),
    )
    .await;
    assert_eq!(
        recv_json(&mut b).await,
        json!({"type": "call-request", "senderId": "peer-A", "callId": "c1", "callType": "video"})
    );

    b.close(None).await.unwrap();
    wait_until_offline(&state, "peer-B").await;

    send_json(
        &mut a,
        json!({"type": "offer", "recipientId": "peer-B", "callId": "c1", "offer": {"sdp": "v=0"}}),
    )
    .await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn negotiation_is_relayed_in_order_with_sender_attributed() {
    let (url, _state) = spawn_relay().await;
    let mut a = connect(&url, "peer-A").await;
    let mut b = connect(&url, "peer-B").await;

    send_json(
        &mut a,
        json!({"type": "call-request", "recipientId": "peer-B", "callId": "c1", "callType": "audio", "name": "Ana"}),
    )
    .await;
    send_json(
        &mut a,
        json!({"type": "offer", "recipientId": "peer-B", "callId": "c1", "offer": {"sdp": "o"}}),
    )
    .await;
    for n in 0..5 {
        send_json(
            &mut a,
            json!({"type": "candidate", "recipientId": "peer-B", "callId": "c1", "candidate": {"n": n}}),
        )
        .await;
    }

    assert_eq!(recv_json(&mut b).await["type"], json!("call-request"));
    assert_eq!(
        recv_json(&mut b).await,
        json!({"type": "offer", "senderId": "peer-A", "callId": "c1", "offer": {"sdp": "o"}})
    );
    for n in 0..5 {
        assert_eq!(
            recv_json(&mut b).await,
            json!({"type": "candidate", "senderId": "peer-A", "callId": "c1", "candidate": {"n": n}})
        );
    }

    send_json(
        &mut b,
        json!({"type": "answer", "recipientId": "peer-A", "senderId": "peer-Z", "callId": "c1", "answer": {"sdp": "a"}}),
    )
    .await;
    assert_eq!(
        recv_json(&mut a).await,
        json!({"type": "answer", "senderId": "peer-B", "callId": "c1", "answer": {"sdp": "a"}})
    );
}

#[tokio::test]
async fn malformed_messages_do_not_close_the_channel() {
    let (url, _state) = spawn_relay().await;
    let mut a = connect(&url, "peer-A").await;
    let mut b = connect(&url, "peer-B").await;

    a.send(Message::text("{broken")).await.unwrap();
    send_json(&mut a, json!({"type": "offer", "callId": "c1", "offer": {}})).await;
    send_json(&mut a, json!({"type": "dance", "recipientId": "peer-B"})).await;
    assert_silent(&mut a).await;

    send_json(
        &mut a,
        json!({"type": "call-accepted", "recipientId": "peer-B", "signal": {"sdp": "s"}}),
    )
    .await;
    assert_eq!(
        recv_json(&mut b).await,
        json!({"type": "call-accepted", "senderId": "peer-A", "signal": {"sdp": "s"}})
    );
}

#[tokio::test]
async fn reconnecting_identity_replaces_old_socket() {
    let (url, state) = spawn_relay().await;
    let mut a = connect(&url, "peer-A").await;
    let mut old = connect(&url, "x").await;
    let mut new = connect(&url, "x").await;

    let reason = timeout(Duration::from_secs(2), async {
        while let Some(Ok(msg)) = old.next().await {
            if let Message::Close(frame) = msg {
                return frame.map(|f| f.reason.to_string());
            }
        }
        None
    })
    .await
    .expect("old socket was not closed");
    assert_eq!(reason.as_deref(), Some("replaced"));

    send_json(&mut a, json!({"type": "call-ended", "recipientId": "x"})).await;
    assert_eq!(
        recv_json(&mut new).await,
        json!({"type": "call-ended", "senderId": "peer-A"})
    );
    assert_eq!(state.router().registry().len(), 2);
}

#[tokio::test]
async fn disconnect_notifies_signalled_peer() {
    let (url, _state) = spawn_relay().await;
    let mut a = connect(&url, "peer-A").await;
    let mut b = connect(&url, "peer-B").await;

    send_json(
        &mut b,
        json!({"type": "call-accepted", "recipientId": "peer-A", "signal": {}}),
    )
    .await;
    recv_json(&mut a).await;

    b.close(None).await.unwrap();
    assert_eq!(
        recv_json(&mut a).await,
        json!({"type": "call-ended", "senderId": "peer-B", "reason": "disconnected"})
    );
}
