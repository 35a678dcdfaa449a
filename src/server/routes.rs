//! API route handlers.
//!
//! All endpoints return JSON. Refusals carry `{success, code, message}`;
//! ledger failures are logged and answered with a generic message.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::error;

use super::AppState;
use crate::engine::{BetReceipt, BetRequest};
use crate::storage::{bounded, LedgerError};
use crate::types::{
    BalanceUpdate, Bet, Rejection, RejectionCode, RoundResult, RoundSnapshot, Transaction, User,
    UserId,
};

/// Upper bound on any `limit` query parameter.
const MAX_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

fn rejection_status(code: RejectionCode) -> StatusCode {
    match code {
        RejectionCode::InvalidKindValue
        | RejectionCode::InvalidAmount
        | RejectionCode::InsufficientBalance => StatusCode::BAD_REQUEST,
        RejectionCode::RoundClosed => StatusCode::CONFLICT,
        RejectionCode::UserBanned => StatusCode::FORBIDDEN,
        RejectionCode::UnknownUser => StatusCode::NOT_FOUND,
        RejectionCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Rejected(r) => (rejection_status(r.code), r.code.as_str(), r.message),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
            ApiError::Ledger(e) => {
                error!(error = %e, "Request failed on ledger call");
                let status = if e.is_transient() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, "internal", "Internal error".to_string())
            }
        };
        (status, Json(json!({ "success": false, "code": code, "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

impl LimitParams {
    fn resolve(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_LIMIT)
    }
}

/// Bet body as sent by clients. `value` may be a string or a number, and
/// `amount` is checked for integrality by the intake, not the extractor.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBetBody {
    #[serde(alias = "user_id")]
    pub user_id: UserId,
    #[serde(alias = "type", alias = "betType")]
    pub kind: String,
    #[serde(alias = "betValue")]
    pub value: Value,
    pub amount: Value,
}

impl From<PlaceBetBody> for BetRequest {
    fn from(body: PlaceBetBody) -> Self {
        let value = match body.value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        BetRequest {
            user_id: body.user_id,
            kind: body.kind,
            value,
            amount: body.amount.as_i64(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AmountBody {
    pub amount: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_rounds: u64,
    pub frequency: BTreeMap<u8, u64>,
    pub colors: BTreeMap<&'static str, u64>,
    pub sizes: BTreeMap<&'static str, u64>,
    pub connections: usize,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// GET /api/game/state
pub async fn get_game_state(State(state): State<AppState>) -> Json<RoundSnapshot> {
    Json(state.engine.snapshot().await)
}

/// GET /api/game/history
pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<RoundResult>> {
    let limit = params.resolve(state.engine.settings().history_limit);
    let rounds = bounded(state.timeout, state.ledger.get_recent_rounds(limit)).await?;
    Ok(Json(rounds.iter().map(RoundResult::from).collect()))
}

/// GET /api/game/stats
pub async fn get_stats(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    let frequency = bounded(state.timeout, state.ledger.get_outcome_frequency()).await?;

    let mut colors = BTreeMap::new();
    let mut sizes = BTreeMap::new();
    for (value, count) in &frequency {
        if let Some(outcome) = crate::types::OutcomeValue::new(*value) {
            *colors.entry(outcome.color().as_str()).or_insert(0) += count;
            *sizes.entry(outcome.size().as_str()).or_insert(0) += count;
        }
    }

    Ok(Json(StatsResponse {
        total_rounds: frequency.values().sum(),
        frequency,
        colors,
        sizes,
        connections: state.engine.hub().connection_count(),
    }))
}

/// POST /api/bet. An accepted bet answers 201.
pub async fn place_bet(
    State(state): State<AppState>,
    Json(body): Json<PlaceBetBody>,
) -> Result<(StatusCode, Json<BetReceipt>), ApiError> {
    let receipt = state.intake.place(body.into()).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn require_user(state: &AppState, id: UserId) -> Result<User, ApiError> {
    bounded(state.timeout, state.ledger.get_user(id))
        .await?
        .ok_or(ApiError::NotFound("User"))
}

/// GET /api/users/:id
pub async fn get_user(State(state): State<AppState>, Path(id): Path<UserId>) -> ApiResult<User> {
    Ok(Json(require_user(&state, id).await?))
}

/// GET /api/users/:id/bets
pub async fn get_user_bets(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<Bet>> {
    require_user(&state, id).await?;
    let bets = bounded(state.timeout, state.ledger.get_user_bets(id, params.resolve(50))).await?;
    Ok(Json(bets))
}

/// GET /api/users/:id/transactions
pub async fn get_user_transactions(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<Transaction>> {
    require_user(&state, id).await?;
    let txs = bounded(
        state.timeout,
        state.ledger.get_user_transactions(id, params.resolve(50)),
    )
    .await?;
    Ok(Json(txs))
}

/// POST /api/users/:id/deposit
pub async fn deposit(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(body): Json<AmountBody>,
) -> ApiResult<BalanceUpdate> {
    let amount = body.amount.as_i64().ok_or_else(Rejection::invalid_amount)?;
    let new_balance = state.wallet.deposit(id, amount).await?;
    Ok(Json(BalanceUpdate { new_balance }))
}

/// POST /api/users/:id/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(body): Json<AmountBody>,
) -> ApiResult<BalanceUpdate> {
    let amount = body.amount.as_i64().ok_or_else(Rejection::invalid_amount)?;
    let new_balance = state.wallet.withdraw(id, amount).await?;
    Ok(Json(BalanceUpdate { new_balance }))
}
