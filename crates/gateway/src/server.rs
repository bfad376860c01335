use std::{net::SocketAddr, sync::Arc};

use {
    aegis_config::AegisConfig,
    aegis_protocol::PROTOCOL_VERSION,
    aegis_ratelimit::Identity,
    axum::{
        Router,
        extract::{Extension, Path, State},
        http::StatusCode,
        middleware,
        response::{IntoResponse, Json},
        routing::{delete, get, post},
    },
    serde_json::json,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

use crate::{
    error::GatewayError,
    events::{self, GatewayEvent},
    middleware::{ResponseCache, rate_limit, require_operator, response_cache},
    state::GatewayState,
    ws::ws_upgrade_handler,
};

/// Tag on cached breaker listings, dropped whenever a circuit is changed by
/// hand.
const BREAKERS_TAG: &str = "breakers";

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Read-through cached reads sit inside the limiter so a cache hit still
    // costs a token and still carries rate limit headers.
    let cached = Router::new()
        .route("/api/breakers", get(breakers_handler))
        .route_layer(middleware::from_fn_with_state(
            ResponseCache::new(Arc::clone(&state)),
            response_cache,
        ));

    let operator = Router::new()
        .route("/api/breakers/{name}/reset", post(breaker_reset_handler))
        .route("/api/breakers/{name}/open", post(breaker_open_handler))
        .route("/api/cache/tags/{tag}", delete(cache_tag_handler))
        .route_layer(middleware::from_fn(require_operator));

    let api = Router::new()
        .route("/api/rate-limit", get(rate_limit_handler))
        .route("/api/events", post(events_handler))
        .merge(operator)
        .merge(cached)
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_upgrade_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Start the gateway HTTP + WebSocket server and serve until the listener
/// fails.
pub async fn start_gateway(config: AegisConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    let state = GatewayState::from_config(config).await?;
    #[cfg(feature = "prometheus")]
    let state = match aegis_metrics::install_prometheus() {
        Ok(handle) => state.with_prometheus(handle),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder not installed");
            state
        },
    };
    let _tasks = state.spawn_background_tasks();

    let app = build_gateway_app(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("aegis gateway v{}", state.version),
        format!("protocol v{PROTOCOL_VERSION}, listening on {addr}"),
        format!(
            "{} circuit breakers: {}",
            state.breakers.len(),
            state.breakers.names().join(", ")
        ),
        format!("cache: {} ({})", state.cache.get_stats().backend, state.cache.prefix()),
        format!(
            "websocket: max {} connections, heartbeat {}ms",
            state.config.websocket.max_connections, state.config.websocket.heartbeat_interval_ms
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    // Run the server with ConnectInfo for remote IP extraction.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": state.version,
        "protocol": PROTOCOL_VERSION,
        "connections": state.realtime.client_count(),
        "cache": state.cache.get_stats().backend,
    }))
}

async fn stats_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.stats())
}

#[cfg(feature = "prometheus")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(not(feature = "prometheus"))]
async fn metrics_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "built without prometheus support")
}

async fn breakers_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.breakers.get_all_stats())
}

async fn breaker_reset_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let breaker = state
        .breakers
        .get(&name)
        .ok_or_else(|| GatewayError::NotFound(format!("no circuit breaker named {name}")))?;
    breaker.reset();
    state.cache.invalidate_tag(BREAKERS_TAG).await;
    info!(circuit = %name, "circuit breaker reset by operator");
    Ok(Json(breaker.stats()))
}

async fn breaker_open_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, GatewayError> {
    let breaker = state
        .breakers
        .get(&name)
        .ok_or_else(|| GatewayError::NotFound(format!("no circuit breaker named {name}")))?;
    breaker.force_open();
    state.cache.invalidate_tag(BREAKERS_TAG).await;
    info!(circuit = %name, "circuit breaker forced open by operator");
    Ok(Json(breaker.stats()))
}

/// Peek at the caller's bucket without spending from it.
async fn rate_limit_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(identity): Extension<Identity>,
) -> impl IntoResponse {
    let info = state.limiter.check_rate_limit(&identity.key, identity.tier);
    Json(json!({
        "identity": identity.key,
        "tier": identity.tier,
        "authenticated": identity.authenticated,
        "limit": info,
    }))
}

async fn events_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(identity): Extension<Identity>,
    Json(event): Json<GatewayEvent>,
) -> Result<impl IntoResponse, GatewayError> {
    if !event.permits(&identity) {
        return Err(GatewayError::Forbidden(format!(
            "{} may not publish this event",
            identity.key
        )));
    }
    let delivered = events::publish(&state.realtime, event);
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}

async fn cache_tag_handler(
    State(state): State<Arc<GatewayState>>,
    Path(tag): Path<String>,
) -> impl IntoResponse {
    let deleted = state.cache.invalidate_tag(&tag).await;
    Json(json!({ "tag": tag, "deleted": deleted }))
}
