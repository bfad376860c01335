//! Shared building blocks for the aegis crates: a mockable wall clock and a
//! poison-tolerant mutex helper.

pub mod clock;
pub mod sync;

pub use {
    clock::{Clock, ManualClock, SystemClock, now_ms},
    sync::lock,
};
