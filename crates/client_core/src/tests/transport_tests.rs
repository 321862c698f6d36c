use std::time::Duration;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tokio::{net::TcpListener, time::timeout};

use super::*;

async fn ws_handler(ws: WebSocketUpgrade, headers: HeaderMap) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer token-1");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(echo_session)
}

/// Greets, then echoes each frame back under an `echo.` prefix. A `bye`
/// event makes the service close the socket; `garble` is preceded by a
/// non-JSON text message.
async fn echo_session(mut socket: WebSocket) {
    let greeting = json!({ "event": "hello", "data": { "n": 1 } }).to_string();
    if socket.send(WsMessage::Text(greeting)).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<EventFrame>(&text) else {
            continue;
        };
        if frame.event == "garble" {
            let _ = socket.send(WsMessage::Text("not json".into())).await;
        }
        if frame.event == "bye" {
            let _ = socket.close().await;
            return;
        }
        let echoed = EventFrame::new(format!("echo.{}", frame.event), frame.data);
        let text = serde_json::to_string(&echoed).unwrap_or_default();
        if socket.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
    }
}

async fn spawn_ws_server() -> String {
    let app = Router::new().route("/ws", get(ws_handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/ws")
}

#[tokio::test]
async fn frames_round_trip_over_websocket() {
    let url = spawn_ws_server().await;
    let connector = WebSocketConnector::new(&url).expect("url");
    assert!(connector.url().starts_with("ws://"));

    let mut link = connector.open("token-1").await.expect("open");
    let hello = timeout(Duration::from_secs(5), link.inbound.recv())
        .await
        .expect("greeting in time")
        .expect("greeting");
    assert_eq!(hello.event, "hello");

    link.outbound
        .send(EventFrame::new("presence.heartbeat", json!({ "watchedId": "u-2" })))
        .await
        .expect("send");
    let echoed = timeout(Duration::from_secs(5), link.inbound.recv())
        .await
        .expect("echo in time")
        .expect("echo");
    assert_eq!(echoed.event, "echo.presence.heartbeat");
    assert_eq!(echoed.data["watchedId"], "u-2");
}

#[tokio::test]
async fn handshake_carries_bearer_credential() {
    let url = spawn_ws_server().await;
    let connector = WebSocketConnector::new(&url).expect("url");
    let err = connector.open("wrong").await.err().expect("rejected");
    assert!(matches!(err, TransportError::Handshake(_)));
}

#[tokio::test]
async fn remote_close_ends_inbound_stream() {
    let url = spawn_ws_server().await;
    let mut link = WebSocketConnector::new(&url)
        .expect("url")
        .open("token-1")
        .await
        .expect("open");
    let _ = link.inbound.recv().await;

    link.outbound
        .send(EventFrame::new("bye", json!(null)))
        .await
        .expect("send");
    let closed = timeout(Duration::from_secs(5), async {
        while link.inbound.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "inbound should end after remote close");
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let url = spawn_ws_server().await;
    let mut link = WebSocketConnector::new(&url)
        .expect("url")
        .open("token-1")
        .await
        .expect("open");
    let _ = link.inbound.recv().await;

    link.outbound
        .send(EventFrame::new("garble", json!("x")))
        .await
        .expect("send");
    let next = timeout(Duration::from_secs(5), link.inbound.recv())
        .await
        .expect("in time")
        .expect("frame");
    assert_eq!(next.event, "echo.garble");
}

#[test]
fn http_urls_map_onto_websocket_schemes() {
    assert_eq!(
        websocket_url("https://chat.example.com/ws").expect("url"),
        "wss://chat.example.com/ws"
    );
    assert_eq!(
        websocket_url("ws://localhost:3001/ws").expect("url"),
        "ws://localhost:3001/ws"
    );
    assert!(matches!(
        websocket_url("ftp://example.com"),
        Err(TransportError::InvalidUrl(_))
    ));
}
