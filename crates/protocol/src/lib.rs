//! WebSocket wire protocol shared by the realtime manager and the gateway.
//!
//! Clients send `{type: "subscribe" | "unsubscribe" | "ping", channel}`.
//! The server answers with `{type, channel?, data, timestamp}` frames.

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// How often the server pings every connected client.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// A client silent for longer than this is disconnected.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

/// Messages kept per channel for users that are not connected.
pub const MAX_QUEUED_PER_CHANNEL: usize = 100;

/// Largest inbound text frame the server will parse.
pub const MAX_CLIENT_FRAME_BYTES: usize = 64 * 1024;

pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const SUBSCRIPTION_DENIED: &str = "SUBSCRIPTION_DENIED";
    pub const SUBSCRIPTION_LIMIT: &str = "SUBSCRIPTION_LIMIT";
    pub const NOT_SUBSCRIBED: &str = "NOT_SUBSCRIBED";
    pub const UNKNOWN_CLIENT: &str = "UNKNOWN_CLIENT";
}

/// Channels with special meaning.
pub mod channels {
    pub const ADMIN: &str = "admin";
    pub const SYSTEM: &str = "system";
    pub const STATS: &str = "stats";
    pub const USER_PREFIX: &str = "user:";

    /// Channel carrying messages addressed to a single user.
    pub fn user(user_id: &str) -> String {
        format!("{USER_PREFIX}{user_id}")
    }

    /// True for `admin`, `system` and their `admin:*` / `system:*` children.
    pub fn is_restricted(channel: &str) -> bool {
        [ADMIN, SYSTEM].iter().any(|root| {
            channel == *root
                || channel
                    .strip_prefix(root)
                    .is_some_and(|rest| rest.starts_with(':'))
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame exceeds {max} bytes")]
    TooLarge { max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("channel name must not be empty")]
    EmptyChannel,
}

// ── Client → server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        if text.len() > MAX_CLIENT_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                max: MAX_CLIENT_FRAME_BYTES,
            });
        }
        let msg: Self = serde_json::from_str(text)?;
        match &msg {
            Self::Subscribe { channel } | Self::Unsubscribe { channel }
                if channel.trim().is_empty() =>
            {
                Err(FrameError::EmptyChannel)
            },
            _ => Ok(msg),
        }
    }
}

// ── Server → client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessageKind {
    Connected,
    Data,
    Error,
    Ping,
    Pong,
    Subscribed,
    Unsubscribed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: ServerMessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: u64,
}

impl ServerMessage {
    pub fn new(
        kind: ServerMessageKind,
        channel: Option<String>,
        data: serde_json::Value,
        timestamp: u64,
    ) -> Self {
        Self {
            kind,
            channel,
            data,
            timestamp,
        }
    }

    pub fn data(channel: &str, data: serde_json::Value, timestamp: u64) -> Self {
        Self::new(
            ServerMessageKind::Data,
            Some(channel.to_string()),
            data,
            timestamp,
        )
    }

    pub fn error(code: &str, message: impl Into<String>, timestamp: u64) -> Self {
        Self::new(
            ServerMessageKind::Error,
            None,
            serde_json::json!({ "code": code, "message": message.into() }),
            timestamp,
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
