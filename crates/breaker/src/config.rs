use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest accepted `timeout_ms`: one day.
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1_000;

/// Thresholds for a single breaker. Immutable once the breaker is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside `monitoring_window_ms` that trip the circuit.
    pub failure_threshold: u32,
    /// Half-open successes needed to close the circuit again.
    pub success_threshold: u32,
    /// Per-call timeout, and how long the circuit stays open before probing.
    pub timeout_ms: u64,
    /// Failures older than this no longer count toward the threshold.
    pub monitoring_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            monitoring_window_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".into());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be at least 1".into());
        }
        if self.timeout_ms == 0 {
            return Err("timeout_ms must be positive".into());
        }
        if self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(format!("timeout_ms must be at most {MAX_TIMEOUT_MS}"));
        }
        if self.monitoring_window_ms == 0 {
            return Err("monitoring_window_ms must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(CircuitBreakerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().contains("failure_threshold"));
    }

    #[test]
    fn timeout_is_bounded() {
        let cfg = CircuitBreakerConfig {
            timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().contains("timeout_ms"));
        let cfg = CircuitBreakerConfig {
            timeout_ms: MAX_TIMEOUT_MS,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: CircuitBreakerConfig =
            serde_json::from_str(r#"{"failure_threshold": 3}"#).unwrap();
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
    }
}
