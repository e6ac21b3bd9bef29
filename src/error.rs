use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Errors the core exposes to callers. `StoreUnavailable` is intentionally
/// absent here — it is always recovered internally (treated as a miss on
/// read, dropped on write) and must never reach this enum.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("upstream quote fetch failed: {0}")]
    UpstreamFailure(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream call timed out")]
    Timeout,
}

impl EngineError {
    /// Whether this error behaves like an upstream failure for fallback
    /// purposes (spec §7: Timeout and CircuitOpen both "behave as
    /// UpstreamFailure" on the caller-facing path).
    pub fn is_upstream_like(&self) -> bool {
        matches!(
            self,
            Self::UpstreamFailure(_) | Self::CircuitOpen | Self::Timeout
        )
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
        };

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
