use {
    aegis_protocol::{HEARTBEAT_INTERVAL_MS, HEARTBEAT_TIMEOUT_MS, MAX_QUEUED_PER_CHANNEL},
    aegis_ratelimit::Tier,
    serde::{Deserialize, Serialize},
};

/// Per-tier caps on concurrent channel subscriptions. `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionLimits {
    pub free: Option<usize>,
    pub pro: Option<usize>,
    pub business: Option<usize>,
    pub enterprise: Option<usize>,
}

impl Default for SubscriptionLimits {
    fn default() -> Self {
        Self {
            free: Some(3),
            pro: Some(10),
            business: Some(50),
            enterprise: None,
        }
    }
}

impl SubscriptionLimits {
    pub fn for_tier(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Business => self.business,
            Tier::Enterprise => self.enterprise,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Upgrades beyond this many open sockets are refused.
    pub max_connections: usize,
    /// Exact `Origin` values accepted. Empty accepts any origin. Requests
    /// without an `Origin` header (non-browser clients) are always accepted.
    pub allowed_origins: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_queued_per_channel: usize,
    /// Offline queues untouched for this long are dropped by the heartbeat
    /// sweep.
    pub queue_ttl_ms: u64,
    /// Most offline queues held at once. A new queue past this evicts the
    /// stalest one.
    pub max_queued_channels: usize,
    /// Outbound frames buffered per client before it is dropped as too slow.
    pub send_buffer: usize,
    pub subscription_limits: SubscriptionLimits,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            allowed_origins: Vec::new(),
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: HEARTBEAT_TIMEOUT_MS,
            max_queued_per_channel: MAX_QUEUED_PER_CHANNEL,
            queue_ttl_ms: 24 * 60 * 60 * 1_000,
            max_queued_channels: 10_000,
            send_buffer: 256,
            subscription_limits: SubscriptionLimits::default(),
        }
    }
}

impl WebSocketConfig {
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allowed_origins.is_empty() => true,
            Some(origin) => {
                let origin = origin.trim_end_matches('/');
                self.allowed_origins
                    .iter()
                    .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(origin))
            },
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".into());
        }
        if self.send_buffer == 0 {
            return Err("send_buffer must be at least 1".into());
        }
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be positive".into());
        }
        if self.queue_ttl_ms == 0 {
            return Err("queue_ttl_ms must be positive".into());
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err("heartbeat_timeout_ms must not be shorter than heartbeat_interval_ms".into());
        }
        Ok(())
    }
}
