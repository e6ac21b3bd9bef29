use axum::response::IntoResponse;
use axum::Json;

/// `GET /health` (spec §6): liveness probe, no dependency on the engine.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
