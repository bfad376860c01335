//! Request layers for the guarded `/api` routes.

use std::{net::SocketAddr, sync::Arc};

use {
    aegis_cache::CacheOptions,
    aegis_ratelimit::{Identity, RateLimitInfo, Tier},
    axum::{
        Json,
        body::{Body, HttpBody, to_bytes},
        extract::{ConnectInfo, Request, State},
        http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use crate::{error::GatewayError, state::GatewayState};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_TIER_HEADER: &str = "x-user-tier";

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Responses larger than this are passed through uncached.
const MAX_CACHED_BODY: usize = 1024 * 1024;

/// Identity headers are trusted as set by the fronting auth proxy.
pub fn request_identity(headers: &HeaderMap, remote: Option<SocketAddr>) -> Identity {
    let user_id = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok());
    let tier = headers
        .get(USER_TIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Tier>().ok());
    Identity::resolve(user_id, tier, remote.map(|addr| addr.ip()))
}

fn remote_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

// ── Rate limiting ────────────────────────────────────────────────────────────

fn set_rate_limit_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(
        RATE_LIMIT_RESET,
        HeaderValue::from(info.reset_time.div_ceil(1_000)),
    );
}

/// Charge the caller's bucket before the handler runs. The resolved
/// [`Identity`] is left in the request extensions for later layers.
pub async fn rate_limit(
    State(state): State<Arc<GatewayState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let identity = request_identity(req.headers(), remote_addr(&req));
    let info = state
        .limiter
        .consume_identity(&identity, state.config.rate_limit.cost);

    if !info.allowed {
        let retry_after = info.retry_after_secs(state.limiter.now_ms());
        debug!(key = %identity.key, tier = %identity.tier, retry_after, "request rate limited");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": {
                    "code": "RATE_LIMITED",
                    "message": format!("rate limit exceeded for tier {}", identity.tier),
                    "retryAfter": retry_after,
                }
            })),
        )
            .into_response();
        let headers = response.headers_mut();
        set_rate_limit_headers(headers, &info);
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    req.extensions_mut().insert(identity);
    let mut response = next.run(req).await;
    set_rate_limit_headers(response.headers_mut(), &info);
    response
}

/// Admit only operators. Runs inside [`rate_limit`], which resolves the
/// caller's [`Identity`].
pub async fn require_operator(req: Request, next: Next) -> Response {
    let Some(identity) = req.extensions().get::<Identity>() else {
        return GatewayError::Forbidden("caller identity unknown".into()).into_response();
    };
    if !identity.is_operator() {
        debug!(key = %identity.key, tier = %identity.tier, path = %req.uri().path(), "operator route refused");
        return GatewayError::Forbidden("operator routes need an enterprise account".into())
            .into_response();
    }
    next.run(req).await
}

// ── Response cache ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    content_type: String,
    body: String,
}

impl CachedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = (status, self.body).into_response();
        if let Ok(content_type) = HeaderValue::from_str(&self.content_type) {
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, content_type);
        }
        response
    }
}

/// Decides whether a buffered response may be stored.
pub type CachePredicate = Arc<dyn Fn(StatusCode, &HeaderMap, &[u8]) -> bool + Send + Sync>;

/// State for [`response_cache`]: the gateway plus the cacheability test.
#[derive(Clone)]
pub struct ResponseCache {
    state: Arc<GatewayState>,
    is_cacheable: CachePredicate,
}

impl ResponseCache {
    /// Cache with the default [`is_cacheable`] rule.
    pub fn new(state: Arc<GatewayState>) -> Self {
        Self {
            state,
            is_cacheable: Arc::new(is_cacheable),
        }
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(StatusCode, &HeaderMap, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.is_cacheable = Arc::new(predicate);
        self
    }
}

/// Successful JSON responses that did not opt out with `no-store` and are
/// not a `{"success": false}` envelope.
pub fn is_cacheable(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> bool {
    let json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let no_store = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|cc| cc.contains("no-store"));
    if status != StatusCode::OK || !json || no_store {
        return false;
    }
    serde_json::from_slice::<Value>(body)
        .is_ok_and(|value| value.get("success") != Some(&Value::Bool(false)))
}

/// Cache tag for a request path: the first segment after `/api`.
pub fn route_tag(path: &str) -> Option<&str> {
    path.strip_prefix("/api/")
        .and_then(|rest| rest.split('/').next())
        .filter(|segment| !segment.is_empty())
}

fn cache_key(identity: Option<&Identity>, req: &Request) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let who = identity.map(|i| i.key.as_str()).unwrap_or("anon:unknown");
    format!("http:{who}:{path}")
}

fn mark(mut response: Response, value: &'static str) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(value));
    response
}

/// Read-through cache for `GET` requests, keyed by caller and path. A miss
/// never changes what the handler returned.
pub async fn response_cache(
    State(layer): State<ResponseCache>,
    req: Request,
    next: Next,
) -> Response {
    let state = &layer.state;
    if req.method() != Method::GET {
        return next.run(req).await;
    }
    let key = cache_key(req.extensions().get::<Identity>(), &req);
    let tag = route_tag(req.uri().path()).map(str::to_string);

    if let Some(hit) = state.cache.get::<CachedResponse>(&key).await {
        return mark(hit.into_response(), "HIT");
    }

    let response = next.run(req).await;
    let bounded = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|len| len <= MAX_CACHED_BODY as u64);
    if !bounded {
        debug!(key = %key, "response body unbounded or too large, not caching");
        return mark(response, "MISS");
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_CACHED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key = %key, error = %e, "failed to buffer response for caching");
            return (StatusCode::BAD_GATEWAY, "response body unavailable").into_response();
        },
    };

    if (layer.is_cacheable)(parts.status, &parts.headers, &bytes)
        && let Ok(text) = std::str::from_utf8(&bytes)
    {
        let entry = CachedResponse {
            status: parts.status.as_u16(),
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string(),
            body: text.to_string(),
        };
        let opts = CacheOptions::ttl(state.config.cache.response_ttl_secs)
            .with_tags(tag.into_iter().chain(["http".to_string()]));
        state.cache.set(&key, &entry, opts).await;
    }

    mark(Response::from_parts(parts, Body::from(bytes)), "MISS")
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use {
        super::*,
        aegis_common::ManualClock,
        aegis_config::AegisConfig,
        aegis_ratelimit::TierLimit,
        axum::{Router, middleware, routing::get},
        tower::ServiceExt,
    };

    fn state(free_max: u32) -> (Arc<GatewayState>, Arc<ManualClock>) {
        let mut config = AegisConfig::default();
        config
            .rate_limit
            .tiers
            .insert("free".into(), TierLimit::new(60_000, free_max));
        let clock = ManualClock::new(1_000_000);
        let state = GatewayState::in_memory(config, clock.clone()).unwrap();
        (state, clock)
    }

    fn limited(state: &Arc<GatewayState>) -> Router {
        Router::new()
            .route("/api/ping", get(|| async { Json(json!({"ok": true})) }))
            .layer(middleware::from_fn_with_state(Arc::clone(state), rate_limit))
    }

    fn get_req(path: &str, user: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(path);
        if let Some(user) = user {
            builder = builder
                .header(USER_ID_HEADER, user)
                .header(USER_TIER_HEADER, "pro");
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn identity_from_headers_or_address() {
        let mut headers = HeaderMap::new();
        let addr: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        assert_eq!(request_identity(&headers, Some(addr)).key, "ip:10.1.2.3");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u1"));
        headers.insert(USER_TIER_HEADER, HeaderValue::from_static("Business"));
        assert_eq!(
            request_identity(&headers, Some(addr)),
            Identity::user("u1", Tier::Business)
        );

        headers.insert(USER_TIER_HEADER, HeaderValue::from_static("platinum"));
        assert_eq!(request_identity(&headers, None).tier, Tier::Free);
    }

    #[test]
    fn cacheability_predicate() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let ok = br#"{"success":true,"data":[]}"#;
        assert!(is_cacheable(StatusCode::OK, &headers, ok));
        assert!(is_cacheable(StatusCode::OK, &headers, b"[1,2]"));
        assert!(!is_cacheable(StatusCode::OK, &headers, br#"{"success":false}"#));
        assert!(!is_cacheable(StatusCode::OK, &headers, b"not json"));
        assert!(!is_cacheable(StatusCode::BAD_GATEWAY, &headers, ok));
        assert!(!is_cacheable(StatusCode::OK, &HeaderMap::new(), ok));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert!(!is_cacheable(StatusCode::OK, &headers, ok));
    }

    #[test]
    fn route_tags() {
        assert_eq!(route_tag("/api/breakers"), Some("breakers"));
        assert_eq!(route_tag("/api/breakers/db/reset"), Some("breakers"));
        assert_eq!(route_tag("/health"), None);
        assert_eq!(route_tag("/api/"), None);
    }

    #[tokio::test]
    async fn sets_headers_and_denies_with_retry_after() {
        let (state, _clock) = state(2);
        let app = limited(&state);

        let first = app.clone().oneshot(get_req("/api/ping", None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-limit"], "2");
        assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

        app.clone().oneshot(get_req("/api/ping", None)).await.unwrap();
        let denied = app.oneshot(get_req("/api/ping", None)).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(denied.headers()[header::RETRY_AFTER], "30");
    }

    #[tokio::test]
    async fn users_are_metered_at_their_own_tier() {
        let (state, _clock) = state(1);
        let app = limited(&state);
        app.clone().oneshot(get_req("/api/ping", None)).await.unwrap();
        let anon = app.clone().oneshot(get_req("/api/ping", None)).await.unwrap();
        assert_eq!(anon.status(), StatusCode::TOO_MANY_REQUESTS);

        let pro = app.oneshot(get_req("/api/ping", Some("u1"))).await.unwrap();
        assert_eq!(pro.status(), StatusCode::OK);
        assert_eq!(pro.headers()["x-ratelimit-limit"], "100");
    }

    #[tokio::test]
    async fn read_through_caches_json_per_caller() {
        let (state, clock) = state(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let app = Router::new()
            .route(
                "/api/widgets",
                get(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({ "call": n }))
                    }
                }),
            )
            .layer(middleware::from_fn_with_state(ResponseCache::new(Arc::clone(&state)), response_cache))
            .layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit));

        let miss = app.clone().oneshot(get_req("/api/widgets", Some("u1"))).await.unwrap();
        assert_eq!(miss.headers()["x-cache"], "MISS");
        let hit = app.clone().oneshot(get_req("/api/widgets", Some("u1"))).await.unwrap();
        assert_eq!(hit.headers()["x-cache"], "HIT");
        assert!(hit.headers().contains_key("x-ratelimit-remaining"));
        let body = to_bytes(hit.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"call":0}"#);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let other = app.clone().oneshot(get_req("/api/widgets", Some("u2"))).await.unwrap();
        assert_eq!(other.headers()["x-cache"], "MISS");

        assert!(state.cache.invalidate_tag("widgets").await >= 2);
        let after = app.clone().oneshot(get_req("/api/widgets", Some("u1"))).await.unwrap();
        assert_eq!(after.headers()["x-cache"], "MISS");

        clock.advance(Duration::from_secs(31));
        let expired = app.oneshot(get_req("/api/widgets", Some("u1"))).await.unwrap();
        assert_eq!(expired.headers()["x-cache"], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let (state, _clock) = state(100);
        let app = Router::new()
            .route(
                "/api/flaky",
                get(|| async { (StatusCode::BAD_GATEWAY, Json(json!({"error": "x"}))) }),
            )
            .layer(middleware::from_fn_with_state(ResponseCache::new(Arc::clone(&state)), response_cache));
        for _ in 0..2 {
            let response = app.clone().oneshot(get_req("/api/flaky", None)).await.unwrap();
            assert_eq!(response.headers()["x-cache"], "MISS");
        }
        assert_eq!(state.cache.get_stats().sets, 0);
    }

    #[tokio::test]
    async fn failure_envelopes_are_not_cached() {
        let (state, _clock) = state(100);
        let app = Router::new()
            .route(
                "/api/jobs",
                get(|| async { Json(json!({"success": false, "error": "busy"})) }),
            )
            .layer(middleware::from_fn_with_state(
                ResponseCache::new(Arc::clone(&state)),
                response_cache,
            ));
        for _ in 0..2 {
            let response = app.clone().oneshot(get_req("/api/jobs", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-cache"], "MISS");
        }
        assert_eq!(state.cache.get_stats().sets, 0);
    }

    #[tokio::test]
    async fn oversized_bodies_pass_through_uncached() {
        let (state, _clock) = state(100);
        let big = "x".repeat(MAX_CACHED_BODY + 10);
        let app = Router::new()
            .route(
                "/api/export",
                get(move || {
                    let big = big.clone();
                    async move { Json(json!({ "blob": big })) }
                }),
            )
            .layer(middleware::from_fn_with_state(
                ResponseCache::new(Arc::clone(&state)),
                response_cache,
            ));

        let response = app.oneshot(get_req("/api/export", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "MISS");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.len() > MAX_CACHED_BODY);
        assert_eq!(state.cache.get_stats().sets, 0);
    }

    #[tokio::test]
    async fn custom_predicate_replaces_default_rule() {
        let (state, _clock) = state(100);
        let layer = ResponseCache::new(Arc::clone(&state))
            .with_predicate(|status, _, _| status == StatusCode::ACCEPTED);
        let app = Router::new()
            .route(
                "/api/queue",
                get(|| async { (StatusCode::ACCEPTED, Json(json!({"queued": 3}))) }),
            )
            .layer(middleware::from_fn_with_state(layer, response_cache));

        let miss = app.clone().oneshot(get_req("/api/queue", None)).await.unwrap();
        assert_eq!(miss.headers()["x-cache"], "MISS");
        let hit = app.oneshot(get_req("/api/queue", None)).await.unwrap();
        assert_eq!(hit.headers()["x-cache"], "HIT");
        assert_eq!(hit.status(), StatusCode::ACCEPTED);
    }
}
