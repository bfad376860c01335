use std::fmt;

use {
    aegis_breaker::CircuitBreakerError,
    aegis_realtime::RealtimeError,
    axum::{
        Json,
        http::{HeaderValue, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::{error, warn},
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A guarded upstream call did not return a value.
    #[error("{message}")]
    Dependency {
        circuit: String,
        /// The circuit is open (this call was rejected or just tripped it).
        open: bool,
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn from_breaker<E: fmt::Display>(err: CircuitBreakerError<E>, now_ms: u64) -> Self {
        let retry_after_secs = err
            .retry_after_ms(now_ms)
            .map(|ms| ms.div_ceil(1_000).max(1));
        Self::Dependency {
            circuit: err.circuit().to_string(),
            open: err.is_open(),
            message: err.to_string(),
            retry_after_secs,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Dependency { open: true, .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Dependency { open: false, .. } => StatusCode::BAD_GATEWAY,
            Self::Realtime(RealtimeError::OriginNotAllowed { .. }) => StatusCode::FORBIDDEN,
            Self::Realtime(RealtimeError::AtCapacity { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Realtime(RealtimeError::UnknownClient(_)) => StatusCode::NOT_FOUND,
            Self::Realtime(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Dependency { open: true, .. } => "CIRCUIT_OPEN",
            Self::Dependency { open: false, .. } => "UPSTREAM_FAILED",
            Self::Realtime(e) => e.code(),
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            Self::Internal(e) => error!(error = %e, "request failed"),
            Self::Dependency { circuit, .. } => warn!(
                circuit = %circuit,
                status = status.as_u16(),
                error = %self,
                "upstream call failed"
            ),
            _ => {},
        }
        let message = match &self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let mut body = json!({ "error": { "code": self.code(), "message": message } });
        if let Self::Dependency { circuit, .. } = &self {
            body["error"]["circuit"] = json!(circuit);
        }

        let mut response = (status, Json(body)).into_response();
        if let Self::Dependency {
            open: true,
            retry_after_secs: Some(secs),
            ..
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        super::*,
        aegis_breaker::{CircuitBreaker, CircuitBreakerConfig},
        aegis_common::{Clock, ManualClock},
    };

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = ManualClock::new(10_000);
        let cb = CircuitBreaker::with_clock(
            "openrouter",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
            clock.clone(),
        );
        (cb, clock)
    }

    #[tokio::test]
    async fn failure_below_threshold_is_bad_gateway() {
        let (cb, clock) = breaker();
        let err = cb
            .execute(|| async { Err::<(), _>("502 from provider") })
            .await
            .unwrap_err();
        let err = GatewayError::from_breaker(err, clock.now_ms());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        let response = err.into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn open_circuit_is_unavailable_with_retry_after() {
        let (cb, clock) = breaker();
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
        }
        let err = cb
            .execute(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        let err = GatewayError::from_breaker(err, clock.now_ms());
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = err.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }

    #[test]
    fn realtime_admission_statuses() {
        let origin: GatewayError = RealtimeError::OriginNotAllowed {
            origin: "https://evil.example".into(),
        }
        .into();
        assert_eq!(origin.status(), StatusCode::FORBIDDEN);
        let full: GatewayError = RealtimeError::AtCapacity { max: 1 }.into();
        assert_eq!(full.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
