//! Circuit breakers guarding calls to unreliable upstream dependencies.
//!
//! A [`CircuitBreaker`] wraps one dependency and moves between
//! `closed → open → half-open → closed` based on call outcomes. The
//! [`CircuitBreakerManager`] keeps one breaker per dependency name.
//!
//! The `open → half-open` transition is lazy: it happens on the first call
//! attempted after `next_attempt`, not on a timer. An idle breaker therefore
//! reports `open` past its cooldown until somebody tries it again.

pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;

pub use {
    breaker::{CircuitBreaker, CircuitBreakerState, CircuitBreakerStats, CircuitStatus},
    config::CircuitBreakerConfig,
    error::CircuitBreakerError,
    events::{BreakerEvent, BreakerEventKind, EventHandler},
    manager::CircuitBreakerManager,
};
