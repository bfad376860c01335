use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    aegis_breaker::{BreakerEvent, BreakerEventKind, CircuitBreakerManager},
    aegis_cache::{CacheManager, CacheStore, MemoryStore, RedisStore},
    aegis_common::{Clock, SystemClock},
    aegis_config::AegisConfig,
    aegis_protocol::channels,
    aegis_ratelimit::TieredRateLimiter,
    aegis_realtime::WebSocketManager,
    serde::Serialize,
    serde_json::{Value, json},
    tokio::task::JoinHandle,
    tracing::{info, warn},
};

use crate::error::GatewayError;

/// Enterprise-only channel carrying circuit state transitions.
pub const BREAKER_CHANNEL: &str = "system:breakers";

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared runtime state. Each manager is built once and shared by every
/// request and background task.
pub struct GatewayState {
    pub breakers: Arc<CircuitBreakerManager>,
    pub limiter: Arc<TieredRateLimiter>,
    pub cache: Arc<CacheManager>,
    pub realtime: Arc<WebSocketManager>,
    pub config: AegisConfig,
    pub clock: Arc<dyn Clock>,
    /// Server version string.
    pub version: String,
    pub hostname: String,
    pub started_at: Instant,
    #[cfg(feature = "prometheus")]
    pub prometheus: Option<aegis_metrics::PrometheusHandle>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub version: String,
    pub hostname: String,
    pub uptime_secs: u64,
    pub breakers: Value,
    pub rate_limiter: Value,
    pub cache: Value,
    pub websocket: Value,
}

impl GatewayState {
    /// Build every manager from config over the given cache backend.
    pub fn new(
        config: AegisConfig,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, GatewayError> {
        let tiers = config
            .rate_limit
            .tier_table()
            .map_err(|e| anyhow::anyhow!("invalid rate limit config: {e}"))?;

        let breakers = Arc::new(CircuitBreakerManager::from_configs(
            config.breaker_configs(),
            Arc::clone(&clock),
        ));
        let limiter = Arc::new(TieredRateLimiter::with_clock(tiers, Arc::clone(&clock)));
        let cache = Arc::new(
            CacheManager::with_clock(store, Arc::clone(&clock))
                .with_prefix(config.cache.prefix.clone())
                .with_default_ttl(config.cache.default_ttl_secs),
        );
        let realtime = Arc::new(WebSocketManager::with_clock(
            config.websocket.clone(),
            Arc::clone(&clock),
        ));

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());

        let state = Arc::new(Self {
            breakers,
            limiter,
            cache,
            realtime,
            config,
            clock,
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            started_at: Instant::now(),
            #[cfg(feature = "prometheus")]
            prometheus: None,
        });
        state.publish_breaker_transitions();
        Ok(state)
    }

    /// Connect the configured cache backend. A Redis outage at startup
    /// degrades to the in-process store instead of refusing to boot.
    pub async fn from_config(config: AegisConfig) -> Result<Arc<Self>, GatewayError> {
        let store: Arc<dyn CacheStore> = match config.cache.redis_url.as_deref() {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(error = %e, "redis unavailable, falling back to in-memory cache");
                    Arc::new(MemoryStore::new())
                },
            },
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(config, store, SystemClock::shared())
    }

    #[cfg(feature = "prometheus")]
    pub fn with_prometheus(
        self: Arc<Self>,
        handle: aegis_metrics::PrometheusHandle,
    ) -> Arc<Self> {
        match Arc::try_unwrap(self) {
            Ok(mut state) => {
                state.prometheus = Some(handle);
                Arc::new(state)
            },
            Err(shared) => {
                warn!("gateway state already shared, prometheus handle not attached");
                shared
            },
        }
    }

    /// State over an in-process cache, for tests and embedding.
    pub fn in_memory(
        config: AegisConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, GatewayError> {
        let store = Arc::new(MemoryStore::with_clock(Arc::clone(&clock)));
        Self::new(config, store, clock)
    }

    /// Forward every breaker state change to the `system:breakers` channel,
    /// for startup breakers and those created on first use alike.
    fn publish_breaker_transitions(self: &Arc<Self>) {
        let realtime = Arc::downgrade(&self.realtime);
        self.breakers.on_create(move |breaker| {
            let realtime = realtime.clone();
            breaker.on(BreakerEventKind::StateChange, move |event: &BreakerEvent| {
                let (Some(realtime), BreakerEvent::StateChange { circuit, from, to }) =
                    (realtime.upgrade(), event)
                else {
                    return;
                };
                realtime.broadcast(
                    BREAKER_CHANNEL,
                    json!({ "circuit": circuit, "from": from, "to": to }),
                    None,
                );
            });
        });
    }

    /// Run an upstream call through the named breaker, creating it with
    /// defaults on first use.
    pub async fn guarded<F, Fut, T, E>(&self, dependency: &str, f: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let breaker = self.breakers.get_or_create(dependency);
        breaker
            .execute(f)
            .await
            .map_err(|e| GatewayError::from_breaker(e, self.clock.now_ms()))
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            version: self.version.clone(),
            hostname: self.hostname.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            breakers: to_value(&self.breakers.get_all_stats()),
            rate_limiter: to_value(&self.limiter.get_stats()),
            cache: to_value(&self.cache.get_stats()),
            websocket: to_value(&self.realtime.get_stats()),
        }
    }

    /// Start heartbeat, bucket sweeping, breaker cleanup, tag index pruning
    /// and the periodic `stats` broadcast. Tasks stop once the state is dropped.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let server = &self.config.server;
        let mut tasks = vec![
            self.realtime.spawn_heartbeat(),
            self.limiter
                .spawn_sweeper(Duration::from_secs(self.config.rate_limit.sweep_interval_secs)),
            self.breakers
                .spawn_maintenance(Duration::from_secs(server.maintenance_interval_secs.max(1))),
            self.cache
                .spawn_pruner(Duration::from_secs(self.config.cache.prune_interval_secs)),
        ];
        if server.stats_interval_secs > 0 {
            let every = Duration::from_secs(server.stats_interval_secs);
            let weak = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let Some(state) = weak.upgrade() else {
                        break;
                    };
                    if state.realtime.subscribers(channels::STATS).is_empty() {
                        continue;
                    }
                    crate::events::publish(
                        &state.realtime,
                        crate::events::GatewayEvent::StatsRefreshed(to_value(&state.stats())),
                    );
                }
            }));
        }
        info!(tasks = tasks.len(), "background tasks started");
        tasks
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        aegis_common::ManualClock,
        aegis_protocol::ServerMessage,
        aegis_ratelimit::Tier,
        aegis_realtime::Outbound,
        axum::http::StatusCode,
    };

    fn state() -> Arc<GatewayState> {
        GatewayState::in_memory(AegisConfig::default(), ManualClock::new(1_000)).unwrap()
    }

    #[test]
    fn breaker_transitions_reach_enterprise_subscribers() {
        let state = state();
        let (client, mut rx) = state.realtime.connect(None, None).unwrap();
        state
            .realtime
            .authenticate(&client, "ops", Tier::Enterprise)
            .unwrap();
        state.realtime.subscribe(&client, BREAKER_CHANNEL).unwrap();
        while rx.try_recv().is_ok() {}

        state.breakers.get("upstream").unwrap().force_open();

        let Ok(Outbound::Text(text)) = rx.try_recv() else {
            panic!("expected a breaker frame");
        };
        let frame: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.channel.as_deref(), Some(BREAKER_CHANNEL));
        assert_eq!(frame.data["circuit"], "upstream");
        assert_eq!(frame.data["to"], "open");
    }

    #[tokio::test]
    async fn breakers_created_on_first_use_also_publish() {
        let state = state();
        let (client, mut rx) = state.realtime.connect(None, None).unwrap();
        state
            .realtime
            .authenticate(&client, "ops", Tier::Enterprise)
            .unwrap();
        state.realtime.subscribe(&client, BREAKER_CHANNEL).unwrap();
        while rx.try_recv().is_ok() {}

        state
            .guarded("openrouter", || async { Ok::<_, String>(1) })
            .await
            .unwrap();
        state.breakers.get("openrouter").unwrap().force_open();

        let Ok(Outbound::Text(text)) = rx.try_recv() else {
            panic!("expected a breaker frame");
        };
        let frame: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.data["circuit"], "openrouter");
        assert_eq!(frame.data["to"], "open");
    }

    #[test]
    fn free_clients_cannot_watch_breakers() {
        let state = state();
        let (client, _rx) = state.realtime.connect(None, None).unwrap();
        assert!(state.realtime.subscribe(&client, BREAKER_CHANNEL).is_err());
    }

    #[tokio::test]
    async fn guarded_calls_map_breaker_errors() {
        let state = state();
        let ok = state
            .guarded("openrouter", || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(ok, 7);
        assert!(state.breakers.get("openrouter").is_some());

        let err = state
            .guarded("openrouter", || async { Err::<u32, _>("timeout".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        state.breakers.get("openrouter").unwrap().force_open();
        let err = state
            .guarded("openrouter", || async { Ok::<_, String>(1) })
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn stats_cover_every_manager() {
        let stats = to_value(&state().stats());
        for key in ["breakers", "rateLimiter", "cache", "websocket"] {
            assert!(stats[key].is_object(), "{key} missing");
        }
    }
}
