//! `GET /price/{chain}/{tokenIn}/{tokenOut}` and `POST /prices` (spec §6).

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::error::EngineError;
use crate::fingerprint::Direction;
use crate::state::AppState;
use crate::store::QuoteStore;
use crate::upstream::QuoteSource;

/// Reads the caller's deadline from `X-Request-Deadline-Ms`, if present and
/// well-formed (spec §5: "a client request carries a deadline"). A missing
/// or malformed header means no client-imposed deadline beyond the
/// breaker's own per-call timeout.
fn client_deadline(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("x-request-deadline-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// `GET /price/{chain}/{tokenIn}/{tokenOut}?amount=&tradeType=`.
pub async fn get_price<S: QuoteSource + 'static, Q: QuoteStore + 'static>(
    State(state): State<AppState<S, Q>>,
    Path((chain, token_in, token_out)): Path<(String, String, String)>,
    Query(query): Query<PriceQueryRaw>,
    headers: HeaderMap,
) -> Result<Response, EngineError> {
    let amount = query.amount;
    let direction = match query.trade_type {
        Some(raw) => Direction::from_str(&raw)?,
        None => crate::config::default_direction(),
    };

    let result = state
        .engine
        .read(&chain, &token_in, &token_out, &amount, direction, client_deadline(&headers))
        .await?;

    let max_age = if result.very_stale {
        1
    } else if result.stale {
        5
    } else {
        30
    };

    let mut data = result.quote.clone();
    if let Some(obj) = data.as_object_mut() {
        if result.stale {
            obj.insert("stale".to_string(), serde_json::json!(true));
        }
        if result.very_stale {
            obj.insert("veryStale".to_string(), serde_json::json!(true));
        }
        if let Some(err) = &result.error {
            obj.insert("error".to_string(), serde_json::json!(err));
        }
    }

    let body = Json(serde_json::json!({
        "success": true,
        "data": data,
        "metadata": {
            "cached": result.cached,
            "stale": result.stale,
            "veryStale": result.very_stale,
            "error": result.error,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
    }));

    let mut response = body.into_response();
    response.headers_mut().insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_str(&format!("max-age={max_age}")).unwrap(),
    );
    Ok(response)
}

/// Raw query-string shape; `tradeType` is optional, so it can't be bound
/// directly to `Direction` via serde without a custom deserializer.
#[derive(Debug, Deserialize)]
pub struct PriceQueryRaw {
    pub amount: String,
    #[serde(rename = "tradeType")]
    pub trade_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPair {
    pub chain_name: String,
    pub token_in: String,
    pub token_out: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub trade_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub pairs: Vec<BatchPair>,
}

/// `POST /prices`: partial-failure-tolerant batch lookup (spec §6). Each pair
/// is resolved independently — one pair's error never aborts the others.
pub async fn get_prices<S: QuoteSource + 'static, Q: QuoteStore + 'static>(
    State(state): State<AppState<S, Q>>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Json<serde_json::Value> {
    let mut results = Vec::with_capacity(request.pairs.len());
    let deadline = client_deadline(&headers);

    for pair in request.pairs {
        let amount = pair.amount.unwrap_or_else(|| "1000".to_string());
        let direction = pair
            .trade_type
            .as_deref()
            .and_then(|s| Direction::from_str(s).ok())
            .unwrap_or_else(crate::config::default_direction);

        let outcome = state
            .engine
            .read(&pair.chain_name, &pair.token_in, &pair.token_out, &amount, direction, deadline)
            .await;

        let entry = match outcome {
            Ok(result) => serde_json::json!({
                "chainName": pair.chain_name,
                "tokenIn": pair.token_in,
                "tokenOut": pair.token_out,
                "success": true,
                "data": result.quote,
                "metadata": {
                    "cached": result.cached,
                    "stale": result.stale,
                    "veryStale": result.very_stale,
                    "error": result.error,
                },
            }),
            Err(e) => serde_json::json!({
                "chainName": pair.chain_name,
                "tokenIn": pair.token_in,
                "tokenOut": pair.token_out,
                "success": false,
                "error": e.to_string(),
            }),
        };

        results.push(entry);
    }

    Json(serde_json::json!({ "results": results }))
}

pub fn routes<S: QuoteSource + 'static, Q: QuoteStore + 'static>() -> Router<AppState<S, Q>> {
    Router::new()
        .route("/price/:chain/:token_in/:token_out", axum::routing::get(get_price))
        .route("/prices", axum::routing::post(get_prices))
}
