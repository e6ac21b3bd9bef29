use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Json, Router};

use crate::state::AppState;
use crate::store::QuoteStore;
use crate::upstream::QuoteSource;

/// `GET /metrics` (spec §6): a point-in-time snapshot of the engine's
/// lock-free counters and latency percentiles.
pub async fn get_metrics<S: QuoteSource + 'static, Q: QuoteStore + 'static>(
    State(state): State<AppState<S, Q>>,
) -> impl IntoResponse {
    Json(state.engine.metrics_snapshot())
}

pub fn routes<S: QuoteSource + 'static, Q: QuoteStore + 'static>() -> Router<AppState<S, Q>> {
    Router::new().route("/metrics", axum::routing::get(get_metrics))
}
