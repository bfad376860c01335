use std::{collections::BTreeSet, net::SocketAddr};

use {
    aegis_ratelimit::Tier,
    serde::Serialize,
    tokio::sync::mpsc::{self, error::TrySendError},
};

pub type ClientId = String;

/// Work for the socket task that owns a client's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized server frame.
    Text(String),
    /// Heartbeat probe: a protocol-level ping plus the JSON ping frame.
    Ping(String),
}

pub(crate) struct WebSocketClient {
    pub id: ClientId,
    pub subscriptions: BTreeSet<String>,
    pub user_id: Option<String>,
    pub user_tier: Option<Tier>,
    pub last_ping: u64,
    pub connected_at: u64,
    pub remote_addr: Option<SocketAddr>,
    pub origin: Option<String>,
    pub sender: mpsc::Sender<Outbound>,
}

impl WebSocketClient {
    /// Unauthenticated clients get the FREE tier's permissions.
    pub fn tier(&self) -> Tier {
        self.user_tier.unwrap_or_default()
    }

    /// Queue a frame without waiting. `false` means the client is gone or
    /// too slow and should be dropped.
    pub fn push(&self, frame: Outbound) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id.clone(),
            subscriptions: self.subscriptions.iter().cloned().collect(),
            user_id: self.user_id.clone(),
            user_tier: self.user_tier,
            last_ping: self.last_ping,
            connected_at: self.connected_at,
            remote_addr: self.remote_addr,
            origin: self.origin.clone(),
        }
    }
}

/// Read-only snapshot of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: ClientId,
    pub subscriptions: Vec<String>,
    pub user_id: Option<String>,
    pub user_tier: Option<Tier>,
    pub last_ping: u64,
    pub connected_at: u64,
    pub remote_addr: Option<SocketAddr>,
    pub origin: Option<String>,
}
