//! Live update fan-out over WebSockets.
//!
//! The [`WebSocketManager`] owns every connected client, the
//! `channel -> subscribers` index and per-channel queues for users who are
//! not connected. All of it sits behind one mutex that is never held across
//! an `.await`, so a client is removed from every channel in one step and
//! frames published to a channel reach each subscriber in publish order.
//!
//! The manager never touches a socket. Each client gets a bounded
//! [`Outbound`] receiver that the transport drains; a full or closed queue
//! counts as a disconnect.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;

pub use {
    client::{ClientId, ClientInfo, Outbound},
    config::{SubscriptionLimits, WebSocketConfig},
    error::RealtimeError,
    manager::{RealtimeStats, WebSocketManager},
};
