// HTTP request handlers for the settlement engine API

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::SharedState;
use crate::error::{EngineError, EngineResult};
use crate::market_resolve::{
    adjudicate_dispute, approve_submission, file_dispute, pending_disputes, submit_resolution, DisputeRequest,
    Evidence, ResolutionRequest,
};
use crate::models::{Actor, Market, MarketOption, Role, Side, Withdrawal};
use crate::settlement::claim_winnings;
use crate::solvency::evaluate_market;
use crate::trading::{execute_trade, SlippageBound, TradeRequest};
use crate::withdrawals::{request_withdrawal, WithdrawalRequest};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

// ===== CALLER IDENTITY =====

/// The gateway in front of the engine authenticates callers and forwards
/// their id and role as headers.
#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EngineError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?;

        let role = match parts.headers.get(USER_ROLE_HEADER).and_then(|v| v.to_str().ok()) {
            Some(r) if r.eq_ignore_ascii_case("admin") => Role::Admin,
            _ => Role::User,
        };
        Ok(Actor { user_id: user_id.to_string(), role })
    }
}

// ===== REQUEST BODIES =====

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeBody {
    pub option_id: String,
    pub side: Side,
    /// Micro-shares; negative sells
    pub quantity: i64,
    #[serde(default)]
    pub slippage: Option<SlippageBound>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveBody {
    pub option_id: String,
    pub outcome: String,
    pub evidence: Evidence,
    #[serde(default)]
    pub winning_side: Option<Side>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeBody {
    pub option_id: String,
    pub reason: String,
    #[serde(default)]
    pub evidence: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdjudicateBody {
    pub upheld: bool,
}

type ApiResult = EngineResult<Json<Value>>;

// ===== ROUTER =====

pub fn router(state: SharedState) -> Router {
    Router::new()
        // ===== TRADING =====
        .route("/markets/:id", get(get_market))
        .route("/markets/:id/trade", post(trade))
        // ===== RESOLUTION & DISPUTES =====
        .route("/markets/:id/resolve", post(resolve))
        .route("/markets/:id/submissions/:sid/approve", post(approve))
        .route("/markets/:id/disputes", get(list_disputes).post(dispute))
        .route("/disputes/:id/adjudicate", post(adjudicate))
        // ===== SETTLEMENT =====
        .route("/options/:id/claim", post(claim))
        .route("/markets/:id/solvency", get(solvency))
        // ===== WITHDRAWALS =====
        .route("/withdrawals", post(withdraw))
        .route("/withdrawals/:id", get(get_withdrawal))
        // ===== HEALTH =====
        .route("/health", get(health_check))
        .route("/activity", get(get_activity))
        .with_state(state)
}

// ===== TRADING ENDPOINTS =====

pub async fn trade(
    State(state): State<SharedState>,
    actor: Actor,
    Path(market_id): Path<String>,
    Json(body): Json<TradeBody>,
) -> ApiResult {
    let request = TradeRequest {
        market_id,
        option_id: body.option_id,
        side: body.side,
        quantity: body.quantity,
        slippage: body.slippage,
    };
    let ctx = state.context();
    let receipt = execute_trade(&state.store, &ctx, &actor.user_id, request).await?;
    Ok(Json(json!({ "success": true, "trade": receipt })))
}

pub async fn get_market(State(state): State<SharedState>, Path(market_id): Path<String>) -> ApiResult {
    let market = state.store.require::<Market>(&market_id).await?;
    let mut options = Vec::new();
    for option_id in state.store.option_ids(&market_id) {
        if let Some(option) = state.store.get::<MarketOption>(&option_id).await {
            options.push(option);
        }
    }
    Ok(Json(json!({ "success": true, "market": market, "options": options })))
}

// ===== RESOLUTION ENDPOINTS =====

pub async fn resolve(
    State(state): State<SharedState>,
    actor: Actor,
    Path(market_id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> ApiResult {
    let request = ResolutionRequest {
        market_id,
        option_id: body.option_id,
        outcome: body.outcome,
        evidence: body.evidence,
        winning_side: body.winning_side,
    };
    let ctx = state.context();
    let outcome = submit_resolution(&state.store, &ctx, &actor, request).await?;
    Ok(Json(json!({ "success": true, "resolution": outcome })))
}

pub async fn approve(
    State(state): State<SharedState>,
    actor: Actor,
    Path((market_id, submission_id)): Path<(String, String)>,
) -> ApiResult {
    let ctx = state.context();
    let outcome = approve_submission(&state.store, &ctx, &actor, &market_id, &submission_id).await?;
    Ok(Json(json!({ "success": true, "resolution": outcome })))
}

pub async fn dispute(
    State(state): State<SharedState>,
    actor: Actor,
    Path(market_id): Path<String>,
    Json(body): Json<DisputeBody>,
) -> ApiResult {
    let request = DisputeRequest {
        market_id,
        option_id: body.option_id,
        reason: body.reason,
        evidence: body.evidence,
    };
    let ctx = state.context();
    let dispute = file_dispute(&state.store, &ctx, &actor.user_id, request).await?;
    Ok(Json(json!({ "success": true, "dispute": dispute })))
}

pub async fn list_disputes(State(state): State<SharedState>, Path(market_id): Path<String>) -> ApiResult {
    state.store.require::<Market>(&market_id).await?;
    let disputes = pending_disputes(&state.store, &market_id).await;
    Ok(Json(json!({ "success": true, "disputes": disputes })))
}

pub async fn adjudicate(
    State(state): State<SharedState>,
    actor: Actor,
    Path(dispute_id): Path<String>,
    Json(body): Json<AdjudicateBody>,
) -> ApiResult {
    let ctx = state.context();
    let dispute = adjudicate_dispute(&state.store, &ctx, &actor, &dispute_id, body.upheld).await?;
    Ok(Json(json!({ "success": true, "dispute": dispute })))
}

// ===== SETTLEMENT ENDPOINTS =====

pub async fn claim(State(state): State<SharedState>, actor: Actor, Path(option_id): Path<String>) -> ApiResult {
    state.context().ensure_available()?;
    let receipt = claim_winnings(&state.store, &state.config.transaction_retry, &actor.user_id, &option_id).await?;
    Ok(Json(json!({ "success": true, "claim": receipt })))
}

pub async fn solvency(State(state): State<SharedState>, Path(market_id): Path<String>) -> ApiResult {
    let ctx = state.context();
    let report = evaluate_market(&state.store, &state.config, ctx.now, &market_id)
        .await?
        .ok_or_else(|| EngineError::lock_conflict("market", &market_id))?;
    Ok(Json(json!({ "success": true, "solvency": report })))
}

// ===== WITHDRAWAL ENDPOINTS =====

pub async fn withdraw(
    State(state): State<SharedState>,
    actor: Actor,
    Json(request): Json<WithdrawalRequest>,
) -> ApiResult {
    let ctx = state.context();
    let withdrawal = request_withdrawal(&state.store, state.queue.as_ref(), &ctx, &actor.user_id, request).await?;
    Ok(Json(json!({ "success": true, "withdrawal": withdrawal })))
}

pub async fn get_withdrawal(
    State(state): State<SharedState>,
    actor: Actor,
    Path(withdrawal_id): Path<String>,
) -> ApiResult {
    let withdrawal = state.store.require::<Withdrawal>(&withdrawal_id).await?;
    // other users' withdrawals look missing rather than forbidden
    if withdrawal.user_id != actor.user_id && !actor.is_admin() {
        return Err(EngineError::not_found("withdrawal", &withdrawal_id));
    }
    Ok(Json(json!({ "success": true, "withdrawal": withdrawal })))
}

// ===== HEALTH =====

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn get_activity(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({ "success": true, "activity": state.activity.recent(100) }))
}
