//! Per-identity admission control with continuously refilling token buckets.
//!
//! Every `(identity, tier)` pair owns one bucket holding up to the tier's
//! `max_requests` tokens. Tokens accrue in proportion to elapsed time, so
//! there are no fixed window boundaries to burst across.

pub mod identity;
pub mod limiter;
pub mod tier;

pub use {
    identity::Identity,
    limiter::{RateLimitInfo, RateLimiterStats, TieredRateLimiter},
    tier::{Tier, TierLimit, TierTable},
};
