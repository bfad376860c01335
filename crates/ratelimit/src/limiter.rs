use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    aegis_common::{Clock, SystemClock},
    aegis_metrics::{counter, definitions::rate_limit as m, gauge},
    dashmap::DashMap,
    serde::Serialize,
    tokio::task::JoinHandle,
    tracing::{debug, trace, warn},
};

use crate::{
    identity::Identity,
    tier::{Tier, TierLimit, TierTable},
};

/// Outcome of an admission check, shaped for `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub allowed: bool,
    /// Whole tokens left; fractional balances are floored.
    pub remaining: u32,
    /// Epoch ms. When allowed: the bucket is full again. When denied: enough
    /// tokens for the rejected request have accrued, or the bucket is full
    /// if the request is larger than the bucket can ever hold.
    pub reset_time: u64,
    pub limit: u32,
    pub window_ms: u64,
}

impl RateLimitInfo {
    /// Seconds for a `Retry-After` header, never less than one.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_time.saturating_sub(now_ms).div_ceil(1_000).max(1)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterStats {
    pub total_buckets: usize,
    pub buckets_by_tier: BTreeMap<Tier, usize>,
    pub allowed: u64,
    pub denied: u64,
    pub evicted: u64,
    pub tiers: TierTable,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: u64,
}

impl TokenBucket {
    fn full(limit: TierLimit, now: u64) -> Self {
        Self {
            tokens: f64::from(limit.max_requests),
            last_refill: now,
        }
    }

    fn refill(&mut self, limit: TierLimit, now: u64) {
        // A clock that steps backwards must not mint tokens.
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill) as f64;
        let max = f64::from(limit.max_requests);
        let gained = elapsed * max / limit.window_ms.max(1) as f64;
        self.tokens = (self.tokens + gained).min(max);
        self.last_refill = now;
    }

    /// Milliseconds until the balance reaches `target`.
    fn ms_until(&self, target: f64, limit: TierLimit) -> u64 {
        let deficit = (target - self.tokens).max(0.0);
        (deficit * limit.window_ms as f64 / f64::from(limit.max_requests.max(1))).ceil() as u64
    }

    fn info(&self, limit: TierLimit, allowed: bool, requested: f64, now: u64) -> RateLimitInfo {
        let max = f64::from(limit.max_requests);
        let target = if allowed { max } else { requested.min(max) };
        RateLimitInfo {
            allowed,
            remaining: self.tokens.floor().max(0.0) as u32,
            reset_time: now + self.ms_until(target, limit),
            limit: limit.max_requests,
            window_ms: limit.window_ms,
        }
    }
}

/// Token-bucket limiter keyed by `(identity, tier)`.
///
/// `consume` never awaits. The map's per-entry lock covers the whole
/// refill-check-spend sequence, so two concurrent requests from one
/// identity can never spend the same token.
pub struct TieredRateLimiter {
    buckets: DashMap<(String, Tier), TokenBucket>,
    tiers: TierTable,
    clock: Arc<dyn Clock>,
    allowed: AtomicU64,
    denied: AtomicU64,
    evicted: AtomicU64,
}

impl Default for TieredRateLimiter {
    fn default() -> Self {
        Self::new(TierTable::default())
    }
}

impl TieredRateLimiter {
    pub fn new(tiers: TierTable) -> Self {
        Self::with_clock(tiers, SystemClock::shared())
    }

    pub fn with_clock(tiers: TierTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: DashMap::new(),
            tiers,
            clock,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Spend `tokens` from the caller's bucket if it holds enough. A denied
    /// request leaves the balance untouched.
    pub fn consume(&self, user_id: &str, tier: Tier, tokens: u32) -> RateLimitInfo {
        let limit = self.tiers.limit(tier);
        let now = self.clock.now_ms();
        let requested = f64::from(tokens);

        let info = {
            let mut bucket = self
                .buckets
                .entry((user_id.to_string(), tier))
                .or_insert_with(|| TokenBucket::full(limit, now));
            bucket.refill(limit, now);
            if requested > f64::from(limit.max_requests) {
                warn!(user_id, %tier, tokens, limit = limit.max_requests, "request costs more than the bucket holds");
            }
            let allowed = bucket.tokens >= requested;
            if allowed {
                bucket.tokens -= requested;
            }
            bucket.info(limit, allowed, requested, now)
        };

        if info.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            trace!(user_id, %tier, remaining = info.remaining, "request admitted");
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            debug!(user_id, %tier, reset_time = info.reset_time, "rate limit exceeded");
        }
        counter!(
            m::DECISIONS_TOTAL,
            "tier" => tier.as_str(),
            "decision" => if info.allowed { "allowed" } else { "denied" }
        )
        .increment(1);
        info
    }

    pub fn consume_identity(&self, identity: &Identity, tokens: u32) -> RateLimitInfo {
        self.consume(&identity.key, identity.tier, tokens)
    }

    /// Report what a one-token request would get, without spending. Does not
    /// create a bucket for unseen identities.
    pub fn check_rate_limit(&self, user_id: &str, tier: Tier) -> RateLimitInfo {
        let limit = self.tiers.limit(tier);
        let now = self.clock.now_ms();
        let mut bucket = self
            .buckets
            .get(&(user_id.to_string(), tier))
            .map(|b| *b)
            .unwrap_or_else(|| TokenBucket::full(limit, now));
        bucket.refill(limit, now);
        let allowed = bucket.tokens >= 1.0;
        bucket.info(limit, allowed, 1.0, now)
    }

    /// Forget every bucket belonging to `user_id`, across tiers.
    pub fn reset(&self, user_id: &str) {
        self.buckets.retain(|(user, _), _| user != user_id);
        debug!(user_id, "rate limit buckets reset");
    }

    /// Evict buckets idle for more than two of their tier's windows.
    /// Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.buckets.len();
        self.buckets.retain(|(_, tier), bucket| {
            let idle = now.saturating_sub(bucket.last_refill);
            idle <= self.tiers.limit(*tier).window_ms.saturating_mul(2)
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            counter!(m::EVICTED_TOTAL).increment(evicted as u64);
            debug!(evicted, remaining = self.buckets.len(), "swept idle rate limit buckets");
        }
        gauge!(m::BUCKETS).set(self.buckets.len() as f64);
        evicted
    }

    /// Run [`sweep`](Self::sweep) periodically. The interval is raised to
    /// the longest tier window if shorter. Stops when the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let every = every.max(Duration::from_millis(self.tiers.longest_window_ms()));
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.sweep();
            }
        })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let mut buckets_by_tier = BTreeMap::new();
        for entry in self.buckets.iter() {
            *buckets_by_tier.entry(entry.key().1).or_insert(0) += 1;
        }
        RateLimiterStats {
            total_buckets: self.buckets.len(),
            buckets_by_tier,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            tiers: self.tiers.clone(),
        }
    }
}
