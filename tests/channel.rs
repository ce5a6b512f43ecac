//! Streaming channel tests over a real WebSocket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use toolguard::GuardConfig;

mod common;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_message(socket: &mut Socket) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read failed");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

async fn next_json(socket: &mut Socket) -> Value {
    match next_message(socket).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn rejected_status(url: &str) -> (u16, bool) {
    match connect_async(url).await {
        Err(WsError::Http(response)) => (
            response.status().as_u16(),
            response.headers().contains_key("retry-after"),
        ),
        Err(other) => panic!("expected HTTP rejection, got {other}"),
        Ok(_) => panic!("handshake unexpectedly succeeded"),
    }
}

async fn expect_close(socket: &mut Socket) -> CloseFrame {
    match next_message(socket).await {
        Message::Close(Some(frame)) => frame,
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn messages_are_acknowledged_in_order() {
    let server = common::start_server(GuardConfig::default()).await;
    let (mut socket, _) = connect_async(server.ws_url("/channel")).await.unwrap();

    let welcome = next_json(&mut socket).await;
    assert_eq!(welcome["type"], "welcome");
    assert!(welcome["client_id"].as_str().unwrap().starts_with("local-"));
    assert_eq!(server.ctx.connections.active_connections(), 1);

    for (seq, body) in ["first", "second"].into_iter().enumerate() {
        socket.send(Message::text(body)).await.unwrap();
        let ack = next_json(&mut socket).await;
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["seq"], seq as u64 + 1);
        assert_eq!(ack["bytes"], body.len());
    }

    let stats = server.ctx.connections.stats();
    assert_eq!(stats.total_messages, 2);

    socket.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.ctx.connections.active_connections(), 0);

    server.stop().await;
}

#[tokio::test]
async fn oversized_messages_close_with_policy_violation() {
    let mut config = GuardConfig::default();
    config.channel.max_message_size = 64;
    let server = common::start_server(config).await;
    let (mut socket, _) = connect_async(server.ws_url("/channel")).await.unwrap();
    next_json(&mut socket).await;

    socket.send(Message::text("x".repeat(100))).await.unwrap();
    let frame = expect_close(&mut socket).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert!(frame.reason.contains("exceeds limit"));

    server.stop().await;
}

#[tokio::test]
async fn message_rate_is_capped_per_connection() {
    let mut config = GuardConfig::default();
    config.channel.max_messages_per_minute = 3;
    let server = common::start_server(config).await;
    let (mut socket, _) = connect_async(server.ws_url("/channel")).await.unwrap();
    next_json(&mut socket).await;

    for _ in 0..3 {
        socket.send(Message::text("ping")).await.unwrap();
        assert_eq!(next_json(&mut socket).await["type"], "ack");
    }
    socket.send(Message::text("ping")).await.unwrap();
    let frame = expect_close(&mut socket).await;
    assert_eq!(frame.code, CloseCode::Policy);

    server.stop().await;
}

#[tokio::test]
async fn per_ip_cap_rejects_the_handshake_and_bans() {
    let mut config = GuardConfig::default();
    config.channel.max_connections_per_ip = 2;
    let server = common::start_server(config).await;

    let (mut first, _) = connect_async(server.ws_url("/channel")).await.unwrap();
    let (_second, _) = connect_async(server.ws_url("/channel")).await.unwrap();
    next_json(&mut first).await;

    let (status, _) = rejected_status(&server.ws_url("/channel")).await;
    assert_eq!(status, 429);

    // Freeing a slot does not lift the ban.
    first.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let (status, retry_after) = rejected_status(&server.ws_url("/channel")).await;
    assert_eq!(status, 429);
    assert!(retry_after);

    server.stop().await;
}

#[tokio::test]
async fn remote_callers_need_internal_access() {
    let server = common::start_server(common::remote_config()).await;

    let (status, _) = rejected_status(&server.ws_url("/channel")).await;
    assert_eq!(status, 403);
    assert_eq!(server.ctx.connections.active_connections(), 0);

    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_open_channels() {
    let server = common::start_server(GuardConfig::default()).await;
    let (mut socket, _) = connect_async(server.ws_url("/channel")).await.unwrap();
    next_json(&mut socket).await;

    server.shutdown.trigger();
    let frame = expect_close(&mut socket).await;
    assert_eq!(frame.code, CloseCode::Away);

    server.stop().await;
}
