use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::domain::{normalize_symbol, PairStatus, PositionSide, Venue};
use crate::orchestrator::Orchestrator;

pub fn router() -> Router<Arc<Orchestrator>> {
    Router::new()
        .route("/keeper/status", get(status))
        .route("/keeper/positions", get(positions))
        .route("/keeper/performance", get(performance))
        .route("/keeper/diagnostics", get(diagnostics))
        .route("/keeper/locks", get(locks))
        .route("/keeper/market-quality", get(market_quality))
        .route("/keeper/execute", post(execute))
        .route("/keeper/market-quality/blacklist", post(blacklist_symbol))
        .route("/keeper/market-quality/blacklist/:symbol", delete(unblacklist_symbol))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    global_lock_held: bool,
    circuit_breaker_state: String,
    active_pair_count: usize,
}

async fn status(State(orchestrator): State<Arc<Orchestrator>>) -> Json<StatusResponse> {
    let active_pairs = orchestrator.store.get_active().await;
    Json(StatusResponse {
        global_lock_held: orchestrator.registry.is_global_lock_held(),
        circuit_breaker_state: format!("{:?}", orchestrator.circuit_breaker.state()),
        active_pair_count: active_pairs.len(),
    })
}

async fn positions(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Vec<crate::domain::Position>> {
    Json(orchestrator.cache.get_all_positions())
}

#[derive(Debug, Deserialize)]
struct PerformanceQuery {
    notional_usd: Option<f64>,
}

async fn performance(
    State(orchestrator): State<Arc<Orchestrator>>,
    axum::extract::Query(query): axum::extract::Query<PerformanceQuery>,
) -> Result<Json<std::collections::HashMap<String, crate::performance::SymbolPerformance>>, StatusCode> {
    let symbols: Vec<String> = orchestrator
        .store
        .get_active()
        .await
        .iter()
        .map(|p| p.symbol.clone())
        .collect();
    let notional_usd = query.notional_usd.unwrap_or(orchestrator.config.max_position_size_usd);
    orchestrator
        .performance
        .aggregate_performance(&symbols, notional_usd)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Serialize)]
struct DiagnosticsResponse {
    active_orders: Vec<crate::domain::Order>,
    pairs_by_status: std::collections::HashMap<String, usize>,
}

async fn diagnostics(State(orchestrator): State<Arc<Orchestrator>>) -> Json<DiagnosticsResponse> {
    let all_pairs = orchestrator.store.get_all().await;
    let mut pairs_by_status = std::collections::HashMap::new();
    for status in [PairStatus::Pending, PairStatus::Complete, PairStatus::SingleLeg, PairStatus::Closed] {
        let count = all_pairs.iter().filter(|p| p.status == status).count();
        pairs_by_status.insert(format!("{status:?}"), count);
    }
    Json(DiagnosticsResponse {
        active_orders: orchestrator.registry.get_all_active_orders(),
        pairs_by_status,
    })
}

#[derive(Debug, Serialize)]
struct LocksResponse {
    global_lock_held: bool,
}

async fn locks(State(orchestrator): State<Arc<Orchestrator>>) -> Json<LocksResponse> {
    Json(LocksResponse {
        global_lock_held: orchestrator.registry.is_global_lock_held(),
    })
}

#[derive(Debug, Serialize)]
struct MarketQualityResponse {
    blacklisted_symbols: Vec<String>,
}

async fn market_quality(State(orchestrator): State<Arc<Orchestrator>>) -> Json<MarketQualityResponse> {
    Json(MarketQualityResponse {
        blacklisted_symbols: orchestrator.config.blacklisted_symbols.clone(),
    })
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    symbol: String,
    venue: Venue,
    side: PositionSide,
    size: f64,
    price: f64,
}

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    accepted: bool,
}

/// Manual order placement for operational use — bypasses the evaluator, not
/// the lock registry: the executor still reserves the slot and drives the
/// fill loop exactly as the main cycle does.
async fn execute(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, StatusCode> {
    let thread_id = uuid::Uuid::new_v4().to_string();
    let symbol = normalize_symbol(&request.symbol);
    if !orchestrator.registry.try_acquire_symbol_lock(&symbol, &thread_id, "admin-execute") {
        return Err(StatusCode::CONFLICT);
    }
    let outcome = orchestrator
        .executor
        .execute_leg(&symbol, request.venue, request.side, request.size, request.price, false, &thread_id)
        .await;
    orchestrator.registry.release_symbol_lock(&symbol, &thread_id);
    match outcome {
        Ok(crate::executor::ExecutionOutcome::Filled { .. }) => Ok(Json(ExecuteResponse { accepted: true })),
        Ok(crate::executor::ExecutionOutcome::Failed { .. }) => Ok(Json(ExecuteResponse { accepted: false })),
        Err(_) => Err(StatusCode::BAD_GATEWAY),
    }
}

#[derive(Debug, Deserialize)]
struct BlacklistRequest {
    symbol: String,
}

async fn blacklist_symbol(State(orchestrator): State<Arc<Orchestrator>>, Json(request): Json<BlacklistRequest>) -> StatusCode {
    orchestrator.evaluator.force_blacklist(&request.symbol);
    StatusCode::NO_CONTENT
}

async fn unblacklist_symbol(State(orchestrator): State<Arc<Orchestrator>>, Path(symbol): Path<String>) -> StatusCode {
    orchestrator.evaluator.force_unblacklist(&symbol);
    StatusCode::NO_CONTENT
}
