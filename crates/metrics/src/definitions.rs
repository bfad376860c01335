use metrics::{describe_counter, describe_gauge, describe_histogram};

pub mod breaker {
    /// Labels: `circuit`, `outcome` (success, failure, timeout, reject).
    pub const CALLS_TOTAL: &str = "aegis_breaker_calls_total";
    /// Labels: `circuit`, `to`.
    pub const TRANSITIONS_TOTAL: &str = "aegis_breaker_transitions_total";
    /// Labels: `circuit`.
    pub const CALL_DURATION_SECONDS: &str = "aegis_breaker_call_duration_seconds";
}

pub mod rate_limit {
    /// Labels: `tier`, `decision` (allowed, denied).
    pub const DECISIONS_TOTAL: &str = "aegis_rate_limit_decisions_total";
    pub const BUCKETS: &str = "aegis_rate_limit_buckets";
    pub const EVICTED_TOTAL: &str = "aegis_rate_limit_buckets_evicted_total";
}

pub mod cache {
    pub const HITS_TOTAL: &str = "aegis_cache_hits_total";
    pub const MISSES_TOTAL: &str = "aegis_cache_misses_total";
    pub const ERRORS_TOTAL: &str = "aegis_cache_errors_total";
    pub const INVALIDATIONS_TOTAL: &str = "aegis_cache_invalidations_total";
    pub const PRUNED_TOTAL: &str = "aegis_cache_tag_members_pruned_total";
}

pub mod websocket {
    pub const CONNECTIONS: &str = "aegis_ws_connections";
    /// Labels: `reason` (capacity, origin).
    pub const REJECTED_TOTAL: &str = "aegis_ws_rejected_total";
    pub const MESSAGES_SENT_TOTAL: &str = "aegis_ws_messages_sent_total";
    pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "aegis_ws_heartbeat_evictions_total";
}

/// Register help text for every metric with the installed recorder.
pub fn describe_all() {
    describe_counter!(breaker::CALLS_TOTAL, "Guarded calls by outcome");
    describe_counter!(breaker::TRANSITIONS_TOTAL, "Circuit state transitions");
    describe_histogram!(
        breaker::CALL_DURATION_SECONDS,
        "Duration of guarded calls that reached the dependency"
    );
    describe_counter!(rate_limit::DECISIONS_TOTAL, "Admission decisions by tier");
    describe_gauge!(rate_limit::BUCKETS, "Live token buckets");
    describe_counter!(rate_limit::EVICTED_TOTAL, "Idle token buckets swept");
    describe_counter!(cache::HITS_TOTAL, "Cache hits");
    describe_counter!(cache::MISSES_TOTAL, "Cache misses");
    describe_counter!(cache::ERRORS_TOTAL, "Cache backend or decode errors");
    describe_counter!(cache::INVALIDATIONS_TOTAL, "Tag invalidations");
    describe_counter!(
        cache::PRUNED_TOTAL,
        "Expired keys removed from tag indexes"
    );
    describe_gauge!(websocket::CONNECTIONS, "Open WebSocket connections");
    describe_counter!(websocket::REJECTED_TOTAL, "Refused WebSocket upgrades");
    describe_counter!(websocket::MESSAGES_SENT_TOTAL, "Frames queued to clients");
    describe_counter!(
        websocket::HEARTBEAT_EVICTIONS_TOTAL,
        "Clients dropped for missing heartbeats"
    );
}
