/// Root config schema. Every section defaults, so an empty file is valid.
use std::collections::BTreeMap;

use {
    aegis_breaker::CircuitBreakerConfig,
    aegis_ratelimit::{Tier, TierLimit, TierTable},
    aegis_realtime::WebSocketConfig,
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AegisConfig {
    pub server: ServerConfig,
    /// One breaker per upstream dependency, keyed by name.
    pub breakers: BTreeMap<String, CircuitBreakerConfig>,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Seconds between `stats` channel broadcasts. Zero disables them.
    pub stats_interval_secs: u64,
    /// Seconds between breaker window cleanups.
    pub maintenance_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8787,
            stats_interval_secs: 5,
            maintenance_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Overrides keyed by tier name (`free`, `PRO`, ...). Unlisted tiers keep
    /// their built-in limits.
    pub tiers: BTreeMap<String, TierLimit>,
    /// Seconds between idle bucket sweeps. Raised to the longest window.
    pub sweep_interval_secs: u64,
    /// Tokens charged per request.
    pub cost: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: BTreeMap::new(),
            sweep_interval_secs: 120,
            cost: 1,
        }
    }
}

impl RateLimitConfig {
    pub fn tier_table(&self) -> Result<TierTable, String> {
        let mut overrides = BTreeMap::new();
        for (name, limit) in &self.tiers {
            let tier: Tier = name.parse().map_err(|e| format!("rate_limit.tiers: {e}"))?;
            overrides.insert(tier, *limit);
        }
        let table = TierTable::merged(&overrides);
        table.validate()?;
        Ok(table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis connection string. Unset keeps the cache in process memory.
    pub redis_url: Option<String>,
    pub prefix: String,
    pub default_ttl_secs: u64,
    /// TTL for cached `GET` responses on guarded routes.
    pub response_ttl_secs: u64,
    /// Seconds between sweeps of expired keys out of tag indexes.
    pub prune_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            prefix: "aegis:cache:".into(),
            default_ttl_secs: 300,
            response_ttl_secs: 30,
            prune_interval_secs: 60,
        }
    }
}

impl AegisConfig {
    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        for (name, breaker) in &self.breakers {
            if let Err(e) = breaker.validate() {
                errors.push(format!("breakers.{name}: {e}"));
            }
        }
        match self.rate_limit.tier_table() {
            Ok(table) if self.rate_limit.cost > table.smallest_bucket() => errors.push(format!(
                "rate_limit.cost {} exceeds the smallest tier bucket ({})",
                self.rate_limit.cost,
                table.smallest_bucket()
            )),
            Ok(_) => {},
            Err(e) => errors.push(e),
        }
        if self.rate_limit.cost == 0 {
            errors.push("rate_limit.cost must be at least 1".to_string());
        }
        if self.cache.prefix.is_empty() {
            errors.push("cache.prefix must not be empty".to_string());
        }
        if let Err(e) = self.websocket.validate() {
            errors.push(format!("websocket: {e}"));
        }
        errors
    }

    /// Breakers to build at startup. An `upstream` breaker is always present
    /// because the gateway guards its own upstream route with it.
    pub fn breaker_configs(&self) -> BTreeMap<String, CircuitBreakerConfig> {
        let mut breakers = self.breakers.clone();
        breakers.entry("upstream".to_string()).or_default();
        breakers
    }
}
