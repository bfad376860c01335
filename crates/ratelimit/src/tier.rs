use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Subscription tier, ordered by trust.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Business,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Pro, Tier::Business, Tier::Enterprise];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
            Self::Business => "BUSINESS",
            Self::Enterprise => "ENTERPRISE",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(Self::Free),
            "PRO" => Ok(Self::Pro),
            "BUSINESS" => Ok(Self::Business),
            "ENTERPRISE" => Ok(Self::Enterprise),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// Bucket size and the time it takes to refill from empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierLimit {
    #[serde(alias = "window_ms")]
    pub window_ms: u64,
    #[serde(alias = "max_requests")]
    pub max_requests: u32,
}

impl TierLimit {
    pub const fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }

    /// Tokens gained per millisecond.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.max_requests) / self.window_ms.max(1) as f64
    }
}

/// Static tier → limit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierTable(BTreeMap<Tier, TierLimit>);

impl Default for TierTable {
    fn default() -> Self {
        Self(BTreeMap::from([
            (Tier::Free, TierLimit::new(60_000, 10)),
            (Tier::Pro, TierLimit::new(60_000, 100)),
            (Tier::Business, TierLimit::new(60_000, 500)),
            (Tier::Enterprise, TierLimit::new(60_000, 2_000)),
        ]))
    }
}

impl TierTable {
    /// Limit for `tier`, falling back to the built-in default when the
    /// table was configured without it.
    pub fn limit(&self, tier: Tier) -> TierLimit {
        self.0.get(&tier).copied().unwrap_or_else(|| {
            Self::default()
                .0
                .get(&tier)
                .copied()
                .unwrap_or(TierLimit::new(60_000, 10))
        })
    }

    pub fn with_limit(mut self, tier: Tier, limit: TierLimit) -> Self {
        self.0.insert(tier, limit);
        self
    }

    /// Overlay configured limits on top of the defaults.
    pub fn merged(overrides: &BTreeMap<Tier, TierLimit>) -> Self {
        let mut table = Self::default();
        for (tier, limit) in overrides {
            table.0.insert(*tier, *limit);
        }
        table
    }

    pub fn longest_window_ms(&self) -> u64 {
        Tier::ALL
            .iter()
            .map(|t| self.limit(*t).window_ms)
            .max()
            .unwrap_or(60_000)
    }

    /// Bucket size of the most restrictive tier.
    pub fn smallest_bucket(&self) -> u32 {
        Tier::ALL
            .iter()
            .map(|t| self.limit(*t).max_requests)
            .min()
            .unwrap_or(0)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (tier, limit) in &self.0 {
            if limit.window_ms == 0 || limit.max_requests == 0 {
                return Err(format!(
                    "tier {tier}: window_ms and max_requests must be positive"
                ));
            }
        }
        Ok(())
    }
}
