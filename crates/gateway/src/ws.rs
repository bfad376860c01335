use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use {
    aegis_protocol::MAX_CLIENT_FRAME_BYTES,
    aegis_ratelimit::Tier,
    aegis_realtime::{Outbound, WebSocketManager},
    axum::{
        body::Bytes,
        extract::{
            ConnectInfo, FromRequestParts, State, WebSocketUpgrade,
            ws::{CloseFrame, Message, WebSocket, close_code},
        },
        http::{HeaderMap, header, request::Parts},
        response::{IntoResponse, Response},
    },
    futures::{SinkExt, StreamExt},
    tracing::{debug, info, warn},
};

use crate::{
    error::GatewayError,
    middleware::{USER_ID_HEADER, USER_TIER_HEADER},
    state::GatewayState,
};

/// Peer address when the server was started with connect info; absent in
/// router-only tests.
#[derive(Debug, Clone, Copy)]
pub struct RemoteAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for RemoteAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

fn header_user(headers: &HeaderMap) -> Option<(String, Tier)> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())?;
    let tier = headers
        .get(USER_TIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    Some((user_id.to_string(), tier))
}

/// Admission runs before the handshake: a disallowed origin gets `403` and a
/// full server `503`, and neither ever receives a socket.
pub async fn ws_upgrade_handler(
    State(state): State<Arc<GatewayState>>,
    RemoteAddr(remote): RemoteAddr,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, GatewayError> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Err(e) = state.realtime.admit(origin.as_deref()) {
        warn!(origin = ?origin, remote = ?remote, error = %e, "websocket upgrade refused");
        return Err(e.into());
    }
    let user = header_user(&headers);
    let realtime = Arc::clone(&state.realtime);
    Ok(ws
        .max_message_size(MAX_CLIENT_FRAME_BYTES)
        .on_upgrade(move |socket| handle_connection(socket, realtime, origin, remote, user))
        .into_response())
}

async fn handle_connection(
    mut socket: WebSocket,
    realtime: Arc<WebSocketManager>,
    origin: Option<String>,
    remote: Option<SocketAddr>,
    user: Option<(String, Tier)>,
) {
    // Capacity can fill between admission and registration.
    let (client_id, mut outbound) = match realtime.connect(origin, remote) {
        Ok(registered) => registered,
        Err(e) => {
            warn!(remote = ?remote, error = %e, "websocket registration failed");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        },
    };
    if let Some((user_id, tier)) = user
        && let Err(e) = realtime.authenticate(&client_id, user_id, tier)
    {
        warn!(client_id = %client_id, error = %e, "websocket authentication failed");
    }

    let (mut sender, mut receiver) = socket.split();

    // Ends when the registry drops the client's sender (disconnect, heartbeat
    // eviction, slow consumer) or the socket write fails.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let sent = match frame {
                Outbound::Text(text) => sender.send(Message::Text(text.into())).await,
                Outbound::Ping(text) => match sender.send(Message::Ping(Bytes::new())).await {
                    Ok(()) => sender.send(Message::Text(text.into())).await,
                    Err(e) => Err(e),
                },
            };
            if sent.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = realtime.handle_client_message(&client_id, text.as_str()) {
                        debug!(client_id = %client_id, error = %e, "client no longer registered");
                        break;
                    }
                },
                Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                    realtime.record_pong(&client_id);
                },
                Some(Ok(Message::Binary(_))) => {
                    debug!(client_id = %client_id, "binary frame ignored");
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(client_id = %client_id, error = %e, "websocket read failed");
                    break;
                },
            },
            _ = &mut send_task => break,
        }
    }

    send_task.abort();
    realtime.disconnect(&client_id);
    info!(client_id = %client_id, "websocket connection closed");
}
