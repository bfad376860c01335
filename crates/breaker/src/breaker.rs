use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use {
    aegis_common::{Clock, SystemClock, lock},
    aegis_metrics::{counter, definitions::breaker as m, histogram},
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::{
    config::CircuitBreakerConfig,
    error::CircuitBreakerError,
    events::{BreakerEvent, BreakerEventKind, EventDispatcher, EventHandler},
};

// ── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker's state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<u64>,
    pub last_success: Option<u64>,
    /// Only set while open.
    pub next_attempt: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTotals {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    #[serde(flatten)]
    pub state: CircuitBreakerState,
    pub totals: CallTotals,
    pub config: CircuitBreakerConfig,
}

struct Inner {
    status: CircuitStatus,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<u64>,
    last_success: Option<u64>,
    next_attempt: Option<u64>,
    /// Timestamps of failures recorded while closed, oldest first.
    recent_failures: VecDeque<u64>,
    totals: CallTotals,
}

impl Inner {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_success: None,
            next_attempt: None,
            recent_failures: VecDeque::new(),
            totals: CallTotals::default(),
        }
    }

    fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            status: self.status,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure: self.last_failure,
            last_success: self.last_success,
            next_attempt: self.next_attempt,
        }
    }

    fn prune_failures(&mut self, cutoff: u64) {
        while self
            .recent_failures
            .front()
            .is_some_and(|&ts| ts < cutoff)
        {
            self.recent_failures.pop_front();
        }
    }
}

enum Outcome {
    Failure(String),
    Timeout,
}

// ── CircuitBreaker ───────────────────────────────────────────────────────────

/// Guards a single dependency.
///
/// State lives behind a synchronous mutex that is never held across an
/// `.await`; the guarded future runs with no lock held.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    events: EventDispatcher,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner::new()),
            events: EventDispatcher::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitBreakerState {
        lock(&self.inner).snapshot()
    }

    pub fn status(&self) -> CircuitStatus {
        lock(&self.inner).status
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = lock(&self.inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.snapshot(),
            totals: inner.totals.clone(),
            config: self.config.clone(),
        }
    }

    /// Subscribe to one kind of breaker event.
    pub fn on(
        &self,
        kind: BreakerEventKind,
        handler: impl Fn(&BreakerEvent) + Send + Sync + 'static,
    ) {
        let handler: EventHandler = Arc::new(handler);
        self.events.on(kind, handler);
    }

    /// Run `f` through the breaker.
    ///
    /// While open (and before `next_attempt`) `f` is not called. Otherwise
    /// its future races `config.timeout`; on timeout the future is dropped
    /// and the attempt counts as a failure. No retries happen here.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if let Err(state) = self.try_acquire() {
            return Err(CircuitBreakerError::Open {
                circuit: self.name.clone(),
                state,
            });
        }

        let started = Instant::now();
        match tokio::time::timeout(self.config.timeout(), f()).await {
            Ok(Ok(value)) => {
                self.record_success(started.elapsed());
                Ok(value)
            },
            Ok(Err(error)) => {
                let state = self.record_failure(Outcome::Failure(error.to_string()));
                Err(CircuitBreakerError::Failed {
                    circuit: self.name.clone(),
                    error,
                    state,
                })
            },
            Err(_) => {
                let state = self.record_failure(Outcome::Timeout);
                Err(CircuitBreakerError::Timeout {
                    circuit: self.name.clone(),
                    timeout_ms: self.config.timeout_ms,
                    state,
                })
            },
        }
    }

    /// Return to closed with all counters cleared.
    pub fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut inner = lock(&self.inner);
            let now = self.clock.now_ms();
            self.transition(&mut inner, CircuitStatus::Closed, now, &mut events);
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.recent_failures.clear();
        }
        info!(circuit = %self.name, "circuit breaker reset");
        events.push(BreakerEvent::Reset {
            circuit: self.name.clone(),
        });
        self.emit_all(&events);
    }

    /// Open the circuit immediately, e.g. to drain a dependency under
    /// maintenance. It probes again after the usual cooldown.
    pub fn force_open(&self) {
        let mut events = Vec::new();
        {
            let mut inner = lock(&self.inner);
            let now = self.clock.now_ms();
            self.transition(&mut inner, CircuitStatus::Open, now, &mut events);
        }
        self.emit_all(&events);
    }

    /// Drop failure history older than the monitoring window. While closed
    /// the counters are rebuilt from what is left, so stale failures stop
    /// counting toward the threshold.
    pub fn cleanup(&self) {
        let mut inner = lock(&self.inner);
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(self.config.monitoring_window_ms);
        inner.prune_failures(cutoff);
        if inner.status == CircuitStatus::Closed {
            let remaining = inner.recent_failures.len() as u32;
            if remaining != inner.failure_count {
                debug!(circuit = %self.name, from = inner.failure_count, to = remaining, "expired stale failures");
            }
            inner.failure_count = remaining;
            inner.success_count = 0;
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Admission check. Performs the lazy open → half-open flip.
    fn try_acquire(&self) -> Result<(), CircuitBreakerState> {
        let mut events = Vec::new();
        let result = {
            let mut inner = lock(&self.inner);
            let now = self.clock.now_ms();
            inner.totals.calls += 1;
            match (inner.status, inner.next_attempt) {
                (CircuitStatus::Open, Some(at)) if now >= at => {
                    self.transition(&mut inner, CircuitStatus::HalfOpen, now, &mut events);
                    Ok(())
                },
                (CircuitStatus::Open, next_attempt) => {
                    inner.totals.rejections += 1;
                    events.push(BreakerEvent::Reject {
                        circuit: self.name.clone(),
                        next_attempt,
                    });
                    Err(inner.snapshot())
                },
                _ => Ok(()),
            }
        };
        if result.is_err() {
            counter!(m::CALLS_TOTAL, "circuit" => self.name.clone(), "outcome" => "reject")
                .increment(1);
        }
        self.emit_all(&events);
        result
    }

    fn record_success(&self, duration: Duration) {
        let mut events = Vec::new();
        {
            let mut inner = lock(&self.inner);
            let now = self.clock.now_ms();
            inner.last_success = Some(now);
            inner.totals.successes += 1;
            match inner.status {
                CircuitStatus::Closed => {
                    inner.failure_count = 0;
                    inner.recent_failures.clear();
                },
                CircuitStatus::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        self.transition(&mut inner, CircuitStatus::Closed, now, &mut events);
                    }
                },
                // A call admitted before the circuit tripped finished late.
                CircuitStatus::Open => {},
            }
        }
        counter!(m::CALLS_TOTAL, "circuit" => self.name.clone(), "outcome" => "success")
            .increment(1);
        histogram!(m::CALL_DURATION_SECONDS, "circuit" => self.name.clone())
            .record(duration.as_secs_f64());
        events.insert(0, BreakerEvent::Success {
            circuit: self.name.clone(),
            duration,
        });
        self.emit_all(&events);
    }

    fn record_failure(&self, outcome: Outcome) -> CircuitBreakerState {
        let mut events = Vec::new();
        let outcome_label = match &outcome {
            Outcome::Failure(error) => {
                debug!(circuit = %self.name, %error, "guarded call failed");
                events.push(BreakerEvent::Failure {
                    circuit: self.name.clone(),
                    error: error.clone(),
                });
                "failure"
            },
            Outcome::Timeout => {
                warn!(circuit = %self.name, timeout_ms = self.config.timeout_ms, "guarded call timed out");
                events.push(BreakerEvent::Timeout {
                    circuit: self.name.clone(),
                    timeout: self.config.timeout(),
                });
                "timeout"
            },
        };

        let state = {
            let mut inner = lock(&self.inner);
            let now = self.clock.now_ms();
            inner.last_failure = Some(now);
            inner.totals.failures += 1;
            if matches!(outcome, Outcome::Timeout) {
                inner.totals.timeouts += 1;
            }
            match inner.status {
                CircuitStatus::Closed => {
                    inner.prune_failures(now.saturating_sub(self.config.monitoring_window_ms));
                    inner.recent_failures.push_back(now);
                    inner.failure_count = inner.recent_failures.len() as u32;
                    if inner.failure_count >= self.config.failure_threshold {
                        self.transition(&mut inner, CircuitStatus::Open, now, &mut events);
                    }
                },
                CircuitStatus::HalfOpen => {
                    self.transition(&mut inner, CircuitStatus::Open, now, &mut events);
                },
                CircuitStatus::Open => {},
            }
            inner.snapshot()
        };

        counter!(m::CALLS_TOTAL, "circuit" => self.name.clone(), "outcome" => outcome_label)
            .increment(1);
        self.emit_all(&events);
        state
    }

    /// Switch status, resetting the counters. Entering open schedules the
    /// next probe; any other state clears it.
    fn transition(
        &self,
        inner: &mut Inner,
        to: CircuitStatus,
        now: u64,
        events: &mut Vec<BreakerEvent>,
    ) {
        let from = inner.status;
        if from == to && to != CircuitStatus::Open {
            return;
        }
        inner.status = to;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.recent_failures.clear();
        inner.next_attempt = match to {
            CircuitStatus::Open => Some(now.saturating_add(self.config.timeout_ms)),
            _ => None,
        };

        if from == to {
            return;
        }
        match to {
            CircuitStatus::Open => {
                warn!(circuit = %self.name, %from, next_attempt = ?inner.next_attempt, "circuit opened")
            },
            _ => info!(circuit = %self.name, %from, %to, "circuit state changed"),
        }
        counter!(m::TRANSITIONS_TOTAL, "circuit" => self.name.clone(), "to" => to.as_str())
            .increment(1);
        events.push(BreakerEvent::StateChange {
            circuit: self.name.clone(),
            from,
            to,
        });
    }

    fn emit_all(&self, events: &[BreakerEvent]) {
        for event in events {
            self.events.emit(event);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
