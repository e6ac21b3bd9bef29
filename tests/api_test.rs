//! Black-box tests driving the axum app end to end, in the teacher's
//! `tests/cors_test.rs` style: build a real `Router`, drive it with
//! `tower::util::ServiceExt::oneshot`, assert on the wire-level response.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::util::ServiceExt;

use quote_cache::api;
use quote_cache::config::EngineConfig;
use quote_cache::engine::Engine;
use quote_cache::state::AppState;
use quote_cache::store::{CacheEntry, InMemoryQuoteStore, QuoteStore};
use quote_cache::tier::TierLabel;
use quote_cache::upstream::StubQuoteSource;

fn test_config() -> EngineConfig {
    EngineConfig {
        worker_count: 2,
        queue_capacity: 100,
        ..EngineConfig::default()
    }
}

async fn app_with(
    source: StubQuoteSource,
    store: InMemoryQuoteStore,
) -> Router {
    let engine = Engine::new(test_config(), source, store);
    let state = AppState::new(engine);

    Router::new()
        .route("/health", axum::routing::get(api::health::health_check))
        .merge(api::price::routes())
        .merge(api::metrics::routes())
        .merge(api::admin::routes())
        .with_state(state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_check_reports_healthy() {
    let app = app_with(StubQuoteSource::always_succeeds(), InMemoryQuoteStore::new()).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
}

/// S1 — fresh hit over HTTP: `max-age=30`, no `stale`/`veryStale` flags.
#[tokio::test]
async fn get_price_fresh_hit_sets_max_age_30() {
    let store = InMemoryQuoteStore::new();
    store
        .set(
            "price:ethereum:usdc:weth:1000:exactin",
            &CacheEntry {
                quote: serde_json::json!({"price": "1.5"}),
                inserted_at_ms: now_ms(),
                tier: TierLabel::T1,
            },
            600,
        )
        .await;

    let app = app_with(StubQuoteSource::always_fails(), store).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/price/ethereum/usdc/weth?amount=1000&tradeType=exactIn")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cache_control = response
        .headers()
        .get(axum::http::header::CACHE_CONTROL)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(cache_control, "max-age=30");

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["metadata"]["cached"], true);
    assert_eq!(json["metadata"]["stale"], false);
}

/// S3 — too-stale entry triggers a synchronous refetch that succeeds.
#[tokio::test]
async fn get_price_cold_miss_fetches_upstream_and_returns_fresh() {
    let app = app_with(StubQuoteSource::always_succeeds(), InMemoryQuoteStore::new()).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/price/ethereum/usdc/weth?amount=1000&tradeType=exactIn")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["metadata"]["cached"], false);
    assert_eq!(json["metadata"]["veryStale"], false);
}

/// Malformed `tradeType` is a `BadRequest`, surfaced as 400 (spec §7).
#[tokio::test]
async fn get_price_rejects_unknown_trade_type() {
    let app = app_with(StubQuoteSource::always_succeeds(), InMemoryQuoteStore::new()).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/price/ethereum/usdc/weth?amount=1000&tradeType=sideways")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Admin tier assignment with an unknown tier label is rejected with 400.
#[tokio::test]
async fn admin_assign_tier_rejects_unknown_tier() {
    let app = app_with(StubQuoteSource::always_succeeds(), InMemoryQuoteStore::new()).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/tiers/T9/pairs")
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "chainName": "ethereum",
                        "tokenIn": "usdc",
                        "tokenOut": "weth",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Admin tier assignment with a valid tier succeeds and is reflected by the
/// engine's registry (checked indirectly via a subsequent forced refresh).
#[tokio::test]
async fn admin_assign_tier_then_force_refresh_succeeds() {
    let app = app_with(StubQuoteSource::always_succeeds(), InMemoryQuoteStore::new()).await;

    let assign = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/tiers/T1/pairs")
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "chainName": "ethereum",
                        "tokenIn": "usdc",
                        "tokenOut": "weth",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(assign.status(), StatusCode::OK);

    let refresh = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/refresh")
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "chainName": "ethereum",
                        "tokenIn": "usdc",
                        "tokenOut": "weth",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(refresh.status(), StatusCode::OK);
}

/// `GET /metrics` returns a JSON snapshot whose hit rate reflects traffic
/// already served by the engine.
#[tokio::test]
async fn metrics_endpoint_reflects_served_traffic() {
    let app = app_with(StubQuoteSource::always_succeeds(), InMemoryQuoteStore::new()).await;

    let _ = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/price/ethereum/usdc/weth?amount=1000&tradeType=exactIn")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["cache_misses"].as_u64().unwrap_or(0) >= 1);
}

/// `POST /prices` resolves each pair independently; one upstream-failing
/// pair never aborts the batch.
#[tokio::test]
async fn batch_prices_resolves_each_pair_independently() {
    let app = app_with(StubQuoteSource::always_succeeds(), InMemoryQuoteStore::new()).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/prices")
                .header(axum::http::header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "pairs": [
                            {"chainName": "ethereum", "tokenIn": "usdc", "tokenOut": "weth"},
                            {"chainName": "ethereum", "tokenIn": "dai", "tokenOut": "weth"},
                        ]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["results"].as_array().unwrap().len(), 2);
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
