use crate::breaker::{CircuitBreakerState, CircuitStatus};

/// Why a guarded call did not produce a value.
///
/// `Open` means the dependency was never called. `Timeout` and `Failed` mean
/// it was called and the outcome counted as a failure. All variants carry a
/// state snapshot taken right after the outcome was recorded.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker '{circuit}' is open")]
    Open {
        circuit: String,
        state: CircuitBreakerState,
    },
    #[error("circuit breaker '{circuit}' timed out after {timeout_ms}ms")]
    Timeout {
        circuit: String,
        timeout_ms: u64,
        state: CircuitBreakerState,
    },
    #[error("circuit breaker '{circuit}' call failed: {error}")]
    Failed {
        circuit: String,
        error: E,
        state: CircuitBreakerState,
    },
}

impl<E> CircuitBreakerError<E> {
    pub fn circuit(&self) -> &str {
        match self {
            Self::Open { circuit, .. }
            | Self::Timeout { circuit, .. }
            | Self::Failed { circuit, .. } => circuit,
        }
    }

    pub fn state(&self) -> &CircuitBreakerState {
        match self {
            Self::Open { state, .. } | Self::Timeout { state, .. } | Self::Failed { state, .. } => {
                state
            },
        }
    }

    /// True when the circuit is currently open, whether this call was
    /// rejected or its failure is what tripped the breaker.
    pub fn is_open(&self) -> bool {
        self.state().status == CircuitStatus::Open
    }

    /// True when the dependency was not invoked at all.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The wrapped call's own error, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Milliseconds until the next probe is allowed, when open.
    pub fn retry_after_ms(&self, now_ms: u64) -> Option<u64> {
        self.state()
            .next_attempt
            .map(|at| at.saturating_sub(now_ms))
    }
}
