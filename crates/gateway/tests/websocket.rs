#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    aegis_common::SystemClock,
    aegis_config::AegisConfig,
    aegis_gateway::{GatewayState, build_gateway_app},
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{self, Message, client::IntoClientRequest},
    },
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(config: AegisConfig) -> (SocketAddr, Arc<GatewayState>) {
    let state = GatewayState::in_memory(config, SystemClock::shared()).unwrap();
    let app = build_gateway_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, headers: &[(&'static str, &str)]) -> Client {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    for (name, value) in headers {
        request
            .headers_mut()
            .insert(*name, value.parse().unwrap());
    }
    let (client, _) = connect_async(request).await.unwrap();
    client
}

/// Next JSON frame, skipping protocol-level pings.
async fn next_frame(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send(client: &mut Client, frame: Value) {
    client
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn subscribe_and_receive_broadcast() {
    let (addr, state) = start(AegisConfig::default()).await;
    let mut client = connect(addr, &[]).await;

    let connected = next_frame(&mut client).await;
    assert_eq!(connected["type"], "connected");
    assert!(connected["data"]["clientId"].is_string());

    send(&mut client, json!({"type": "subscribe", "channel": "news"})).await;
    assert_eq!(next_frame(&mut client).await["type"], "subscribed");

    let reached = state.realtime.broadcast("news", json!({"headline": "up"}), None);
    assert_eq!(reached, 1);
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["type"], "data");
    assert_eq!(frame["channel"], "news");
    assert_eq!(frame["data"]["headline"], "up");

    send(&mut client, json!({"type": "ping"})).await;
    assert_eq!(next_frame(&mut client).await["type"], "pong");
}

#[tokio::test]
async fn malformed_frames_get_an_error_reply() {
    let (addr, _state) = start(AegisConfig::default()).await;
    let mut client = connect(addr, &[]).await;
    next_frame(&mut client).await;

    client
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    let frame = next_frame(&mut client).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["data"]["code"], "INVALID_MESSAGE");

    send(&mut client, json!({"type": "subscribe", "channel": "admin"})).await;
    assert_eq!(next_frame(&mut client).await["data"]["code"], "SUBSCRIPTION_DENIED");
}

#[tokio::test]
async fn queued_user_messages_flush_on_subscribe() {
    let (addr, state) = start(AegisConfig::default()).await;
    assert_eq!(state.realtime.send_to_user("u1", json!({"n": 1})), 0);

    let mut client = connect(addr, &[("x-user-id", "u1"), ("x-user-tier", "pro")]).await;
    next_frame(&mut client).await;

    send(&mut client, json!({"type": "subscribe", "channel": "user:u1"})).await;
    let mut frames = vec![next_frame(&mut client).await, next_frame(&mut client).await];
    frames.sort_by_key(|f| f["type"].as_str().map(str::to_string));
    assert_eq!(frames[0]["type"], "data");
    assert_eq!(frames[0]["data"]["n"], 1);
    assert_eq!(frames[1]["type"], "subscribed");
    assert_eq!(state.realtime.queued("user:u1"), 0);
}

#[tokio::test]
async fn closing_the_socket_unregisters_the_client() {
    let (addr, state) = start(AegisConfig::default()).await;
    let mut client = connect(addr, &[]).await;
    next_frame(&mut client).await;
    assert_eq!(state.realtime.client_count(), 1);

    client.close(None).await.unwrap();
    for _ in 0..50 {
        if state.realtime.client_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client still registered after close");
}

#[tokio::test]
async fn foreign_origin_and_full_server_are_refused_before_upgrade() {
    let mut config = AegisConfig::default();
    config.websocket.allowed_origins = vec!["https://app.example.com".into()];
    config.websocket.max_connections = 1;
    let (addr, _state) = start(config).await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "https://evil.example".parse().unwrap());
    match connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }

    let mut first = connect(addr, &[("origin", "https://app.example.com")]).await;
    next_frame(&mut first).await;
    let request = format!("ws://{addr}/ws").into_client_request().unwrap();
    match connect_async(request).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
}
