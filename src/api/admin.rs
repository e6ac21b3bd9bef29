//! `POST /admin/tiers/{tier}/pairs` and `POST /admin/refresh` (spec §6).

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::{Json, Router};
use serde::Deserialize;
use std::str::FromStr;

use crate::error::EngineError;
use crate::fingerprint::Direction;
use crate::state::AppState;
use crate::store::QuoteStore;
use crate::tier::TierLabel;
use crate::upstream::QuoteSource;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTierBody {
    pub chain_name: String,
    pub token_in: String,
    pub token_out: String,
}

/// `POST /admin/tiers/{tier}/pairs`: assigns a pair to `tier`. Unknown tiers
/// are rejected with 400 (spec §6).
pub async fn assign_tier<S: QuoteSource + 'static, Q: QuoteStore + 'static>(
    State(state): State<AppState<S, Q>>,
    Path(tier): Path<String>,
    Json(body): Json<AssignTierBody>,
) -> Result<impl IntoResponse, EngineError> {
    let tier = TierLabel::from_str(&tier)?;
    state
        .engine
        .assign_tier(&body.chain_name, &body.token_in, &body.token_out, tier);

    Ok(Json(serde_json::json!({
        "success": true,
        "chainName": body.chain_name,
        "tokenIn": body.token_in,
        "tokenOut": body.token_out,
        "tier": tier.to_string(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceRefreshBody {
    pub chain_name: String,
    pub token_in: String,
    pub token_out: String,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub trade_type: Option<String>,
}

/// `POST /admin/refresh`: enqueues a High-priority refresh. Never silently
/// dropped (spec §5) — the queue always makes room for High-priority work.
pub async fn force_refresh<S: QuoteSource + 'static, Q: QuoteStore + 'static>(
    State(state): State<AppState<S, Q>>,
    Json(body): Json<ForceRefreshBody>,
) -> Result<impl IntoResponse, EngineError> {
    let amount = body.amount.unwrap_or_else(|| "1000".to_string());
    let direction = match body.trade_type {
        Some(raw) => Direction::from_str(&raw)?,
        None => crate::config::default_direction(),
    };

    state
        .engine
        .force_refresh(&body.chain_name, &body.token_in, &body.token_out, &amount, direction)
        .await;

    Ok(Json(serde_json::json!({ "success": true })))
}

pub fn routes<S: QuoteSource + 'static, Q: QuoteStore + 'static>() -> Router<AppState<S, Q>> {
    Router::new()
        .route("/admin/tiers/:tier/pairs", axum::routing::post(assign_tier))
        .route("/admin/refresh", axum::routing::post(force_refresh))
}
