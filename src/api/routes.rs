use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::health::{HealthState, WatcherStatus};
use crate::api::latency::LatencyStats;
use crate::db::models::{CheckpointRow, SystemStats};
use crate::db::Store;
use crate::error::AppError;
use crate::ledger::{address_key, parse_address, Address};
use crate::sync::Reconciler;
use crate::types::{now_secs, AnomalyEvent, Balance, Candle, Payout, Policy};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1_000;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub reconciler: Reconciler,
    /// Used by /balance when no token is given.
    pub token_address: Address,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/anomalies", get(get_anomalies))
        .route("/prices", get(get_prices))
        .route("/payouts", get(get_payouts))
        .route("/policies", get(get_policies))
        .route("/balance", get(get_balance))
        .route("/stats", get(get_stats))
        .route("/stats/latency", get(get_stats_latency))
        .route("/users/:address/refresh", post(refresh_user))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct PricesQuery {
    pub symbol: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct AddressQuery {
    pub address: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct BalanceQuery {
    pub address: String,
    pub token: Option<String>,
}

fn limit(raw: Option<i64>) -> i64 {
    raw.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Normalizes to the lowercase form the store keys on.
fn user_key(raw: Option<&str>) -> Result<Option<String>, AppError> {
    raw.map(|a| parse_address(a).map(|a| address_key(&a)))
        .transpose()
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct WatcherResponse {
    pub address: String,
    #[serde(flatten)]
    pub status: WatcherStatus,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ledger_reachable: bool,
    pub last_payout_at: Option<i64>,
    pub payouts_sent: u64,
    pub payouts_failed: u64,
    pub watchers: Vec<WatcherResponse>,
    /// Persisted scan position per watched contract.
    pub checkpoints: Vec<CheckpointRow>,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct RefreshAccepted {
    pub status: &'static str,
    pub address: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let h = &state.health;
    let ledger_reachable = h.ledger_reachable();
    let last = h.last_payout_at();
    let checkpoints = state.store.checkpoints().await?;
    Ok(Json(HealthResponse {
        status: if ledger_reachable { "ok" } else { "degraded" },
        ledger_reachable,
        last_payout_at: (last > 0).then_some(last),
        payouts_sent: h.payouts_sent(),
        payouts_failed: h.payouts_failed(),
        watchers: h
            .watcher_snapshot()
            .into_iter()
            .map(|(address, status)| WatcherResponse { address, status })
            .collect(),
        checkpoints,
    }))
}

async fn get_anomalies(
    State(state): State<ApiState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<Vec<AnomalyEvent>>, AppError> {
    Ok(Json(state.store.recent_anomalies(limit(params.limit)).await?))
}

async fn get_prices(
    State(state): State<ApiState>,
    Query(params): Query<PricesQuery>,
) -> Result<Json<Vec<Candle>>, AppError> {
    let rows = state
        .store
        .recent_candles(params.symbol.as_deref(), limit(params.limit))
        .await?;
    Ok(Json(rows))
}

async fn get_payouts(
    State(state): State<ApiState>,
    Query(params): Query<AddressQuery>,
) -> Result<Json<Vec<Payout>>, AppError> {
    let user = user_key(params.address.as_deref())?;
    let rows = state
        .store
        .recent_payouts(user.as_deref(), limit(params.limit))
        .await?;
    Ok(Json(rows))
}

async fn get_policies(
    State(state): State<ApiState>,
    Query(params): Query<AddressQuery>,
) -> Result<Json<Vec<Policy>>, AppError> {
    let user = user_key(params.address.as_deref())?;
    let rows = state
        .store
        .policies(user.as_deref(), limit(params.limit))
        .await?;
    Ok(Json(rows))
}

/// `null` when the balance has never been cached.
async fn get_balance(
    State(state): State<ApiState>,
    Query(params): Query<BalanceQuery>,
) -> Result<Json<Option<Balance>>, AppError> {
    let user = parse_address(&params.address)?;
    let token = match params.token.as_deref() {
        Some(t) => parse_address(t)?,
        None => state.token_address,
    };
    let row = state
        .store
        .balance_for(&address_key(&token), &address_key(&user))
        .await?;
    Ok(Json(row))
}

async fn get_stats(State(state): State<ApiState>) -> Result<Json<SystemStats>, AppError> {
    Ok(Json(state.store.stats(now_secs()).await?))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    let (p50_ms, p95_ms, p99_ms) = state.latency.percentiles();
    Json(LatencyResponse {
        samples: state.latency.len(),
        p50_ms,
        p95_ms,
        p99_ms,
    })
}

/// Fire-and-forget: the reconciliation runs after the response is sent.
async fn refresh_user(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<(StatusCode, Json<RefreshAccepted>), AppError> {
    let user = parse_address(&address)?;
    let reconciler = state.reconciler.clone();
    tokio::spawn(async move {
        if let Err(e) = reconciler.refresh_user(user).await {
            warn!(user = %user, "on-demand refresh failed: {e}");
        }
    });
    info!(user = %user, "user refresh accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshAccepted {
            status: "accepted",
            address: address_key(&user),
        }),
    ))
}
