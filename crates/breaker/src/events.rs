use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use aegis_common::lock;

use crate::breaker::CircuitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerEventKind {
    Success,
    Failure,
    Timeout,
    Reject,
    Reset,
    StateChange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreakerEvent {
    Success {
        circuit: String,
        duration: Duration,
    },
    Failure {
        circuit: String,
        error: String,
    },
    Timeout {
        circuit: String,
        timeout: Duration,
    },
    Reject {
        circuit: String,
        next_attempt: Option<u64>,
    },
    Reset {
        circuit: String,
    },
    StateChange {
        circuit: String,
        from: CircuitStatus,
        to: CircuitStatus,
    },
}

impl BreakerEvent {
    pub fn kind(&self) -> BreakerEventKind {
        match self {
            Self::Success { .. } => BreakerEventKind::Success,
            Self::Failure { .. } => BreakerEventKind::Failure,
            Self::Timeout { .. } => BreakerEventKind::Timeout,
            Self::Reject { .. } => BreakerEventKind::Reject,
            Self::Reset { .. } => BreakerEventKind::Reset,
            Self::StateChange { .. } => BreakerEventKind::StateChange,
        }
    }

    pub fn circuit(&self) -> &str {
        match self {
            Self::Success { circuit, .. }
            | Self::Failure { circuit, .. }
            | Self::Timeout { circuit, .. }
            | Self::Reject { circuit, .. }
            | Self::Reset { circuit }
            | Self::StateChange { circuit, .. } => circuit,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&BreakerEvent) + Send + Sync>;

/// Dispatch table from event kind to subscribed handlers.
#[derive(Default)]
pub(crate) struct EventDispatcher {
    handlers: Mutex<HashMap<BreakerEventKind, Vec<EventHandler>>>,
}

impl EventDispatcher {
    pub(crate) fn on(&self, kind: BreakerEventKind, handler: EventHandler) {
        lock(&self.handlers).entry(kind).or_default().push(handler);
    }

    /// Handlers run outside the table lock, so they may register more
    /// handlers or inspect the breaker.
    pub(crate) fn emit(&self, event: &BreakerEvent) {
        let handlers = lock(&self.handlers)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }
}
