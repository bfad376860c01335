//! Gateway: the HTTP and WebSocket surface around the resilience core.
//!
//! Request path for guarded routes:
//! 1. Rate limit admission (`429` with `Retry-After` when denied)
//! 2. Read-through response cache (`X-Cache: HIT` short-circuits)
//! 3. Handler, calling upstreams through a named circuit breaker
//!
//! `/ws` upgrades into the realtime channel hub; `/stats` and `/metrics`
//! expose the managers' counters.

pub mod error;
pub mod events;
pub mod middleware;
pub mod server;
pub mod state;
pub mod ws;

pub use {
    error::GatewayError,
    events::GatewayEvent,
    server::{build_gateway_app, start_gateway},
    state::GatewayState,
};
