//! Orchestrator: owns the full component graph and runs the main hourly
//! cycle. Implements `CoreActions`, the minimal trait the Reconciler and
//! Guardian depend on, breaking what would otherwise be a three-way cyclic
//! dependency between Reconciler, Guardian, and Orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cache::MarketStateCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::domain::{HedgedPair, PairStatus, PositionSide, Venue};
use crate::error::{CoreError, CoreResult};
use crate::evaluator::{FundingQuote, OpportunityEvaluator};
use crate::executor::{ExecutionOutcome, OrderExecutor};
use crate::guardian::Guardian;
use crate::lock_registry::ExecutionLockRegistry;
use crate::performance::PerformanceLogger;
use crate::position_store::PositionStateStore;
use crate::prediction::PredictionService;
use crate::reconciler::Reconciler;
use crate::venue::VenueAdapter;

/// The minimal surface Reconciler/Guardian need from the orchestrator: close
/// a leg, place a leg, or partially close a leg. Keeping this trait small
/// means neither supervisor needs to know about opportunity ranking,
/// scheduling cadences, or the circuit breaker.
#[async_trait]
pub trait CoreActions: Send + Sync {
    async fn close_position(&self, venue: Venue, symbol: &str, side: PositionSide, size: f64, thread_id: &str) -> CoreResult<ExecutionOutcome>;
    async fn place_order(&self, venue: Venue, symbol: &str, side: PositionSide, size: f64, price: f64, thread_id: &str) -> CoreResult<ExecutionOutcome>;
    async fn partial_close(&self, venue: Venue, symbol: &str, side: PositionSide, fraction: f64, thread_id: &str) -> CoreResult<ExecutionOutcome>;
}

/// Flat taker-fee assumption used for the rotation pass's churn-cost model,
/// matching the fee rate `find_opportunities` quotes per venue until a real
/// per-venue fee schedule is wired in.
const ROTATION_FEE_RATE: f64 = 0.0002;

pub struct Orchestrator {
    pub registry: Arc<ExecutionLockRegistry>,
    pub cache: Arc<MarketStateCache>,
    pub store: Arc<PositionStateStore>,
    pub adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    pub executor: Arc<OrderExecutor>,
    pub evaluator: Arc<OpportunityEvaluator>,
    pub guardian: Arc<Guardian>,
    pub reconciler: Arc<Reconciler>,
    pub performance: Arc<PerformanceLogger>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub prediction: Arc<dyn PredictionService>,
    pub config: Config,
}

#[async_trait]
impl CoreActions for Orchestrator {
    async fn close_position(&self, venue: Venue, symbol: &str, side: PositionSide, size: f64, thread_id: &str) -> CoreResult<ExecutionOutcome> {
        let price = self.mark_price(venue, symbol).await?;
        self.executor.execute_leg(symbol, venue, side, size, price, true, thread_id).await
    }

    async fn place_order(&self, venue: Venue, symbol: &str, side: PositionSide, size: f64, price: f64, thread_id: &str) -> CoreResult<ExecutionOutcome> {
        self.executor.execute_leg(symbol, venue, side, size, price, false, thread_id).await
    }

    async fn partial_close(&self, venue: Venue, symbol: &str, side: PositionSide, fraction: f64, thread_id: &str) -> CoreResult<ExecutionOutcome> {
        let position = self
            .cache
            .get_position(venue, symbol)
            .ok_or_else(|| CoreError::InvariantViolation(format!("no cached position for {venue}/{symbol}")))?;
        let price = self.mark_price(venue, symbol).await?;
        self.executor
            .execute_leg(symbol, venue, side, position.size.abs() * fraction, price, true, thread_id)
            .await
    }
}

impl Orchestrator {
    async fn mark_price(&self, venue: Venue, symbol: &str) -> CoreResult<f64> {
        if let Some(price) = self.cache.get_mark_price(venue, symbol) {
            return Ok(price);
        }
        let adapter = self
            .adapters
            .get(&venue)
            .ok_or_else(|| CoreError::InvariantViolation(format!("no adapter for venue {venue}")))?;
        adapter.get_mark_price(symbol).await
    }

    /// §4.9: replays persisted pairs against venue truth, then starts the
    /// main cycle after a short warm-up delay.
    pub async fn run_startup_sequence(&self) -> CoreResult<()> {
        self.reconciler.reconcile_on_startup().await?;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        info!("startup reconciliation complete, main cycle starting");
        Ok(())
    }

    /// §4.8 main cycle: refresh cache, find opportunities, open new pairs
    /// under per-symbol locks, run the rotation pass against held pairs, log
    /// a portfolio summary. Gated by the circuit breaker for new opens
    /// only — reduce-only actions are never blocked.
    pub async fn run_main_cycle(&self, thread_id: &str) -> CoreResult<()> {
        self.cache.refresh_all().await;

        if !self.circuit_breaker.allow_open() {
            warn!("circuit breaker open, skipping new-pair search this cycle");
            return Ok(());
        }

        let active_pairs = self.store.get_active().await;
        let candidates = self.find_opportunities(&active_pairs).await?;

        for opportunity in &candidates {
            if self.registry.is_in_execution_cooldown(&opportunity.symbol, self.config.execution_cooldown) {
                continue;
            }
            if !self.registry.try_acquire_symbol_lock(&opportunity.symbol, thread_id, "main-cycle-open") {
                continue;
            }
            self.open_pair_locked(opportunity, thread_id).await?;
            self.registry.release_symbol_lock(&opportunity.symbol, thread_id);
        }

        self.run_rotation_pass(&candidates, thread_id).await?;
        self.log_portfolio_summary().await;
        Ok(())
    }

    fn default_size(&self, opportunity: &crate::evaluator::Opportunity) -> f64 {
        if opportunity.long_venue == opportunity.short_venue {
            0.0
        } else {
            1.0
        }
    }

    /// Opens one new pair. Assumes the caller already holds the symbol
    /// lock(s) needed — both the main-cycle open loop and the rotation pass
    /// share this so a held pair is never opened twice under different lock
    /// discipline.
    async fn open_pair_locked(&self, opportunity: &crate::evaluator::Opportunity, thread_id: &str) -> CoreResult<()> {
        let size = self.default_size(opportunity);
        let long_price = self.mark_price(opportunity.long_venue, &opportunity.symbol).await.unwrap_or(0.0);
        let short_price = self.mark_price(opportunity.short_venue, &opportunity.symbol).await.unwrap_or(0.0);

        let notional = size * long_price.max(1.0);
        let expected_return_percent_per_hour = if notional > 0.0 {
            opportunity.expected_return_usd_per_hour / notional * 100.0
        } else {
            0.0
        };
        let pair = HedgedPair::new_with_expected_return(
            opportunity.symbol.clone(),
            opportunity.long_venue,
            opportunity.short_venue,
            size,
            expected_return_percent_per_hour,
        );
        self.store.save(pair.clone()).await?;

        let long_outcome = self
            .executor
            .execute_leg(&opportunity.symbol, opportunity.long_venue, PositionSide::Long, pair.intended_size, long_price, false, thread_id)
            .await;
        let short_outcome = self
            .executor
            .execute_leg(&opportunity.symbol, opportunity.short_venue, PositionSide::Short, pair.intended_size, short_price, false, thread_id)
            .await;

        match (long_outcome, short_outcome) {
            (Ok(ExecutionOutcome::Filled { .. }), Ok(ExecutionOutcome::Filled { .. })) => {
                self.store.mark_complete(&pair.pair_id).await?;
                info!(symbol = %opportunity.symbol, "opened hedged pair");
            }
            (Ok(ExecutionOutcome::Filled { .. }), _) => {
                self.store.mark_single_leg(&pair.pair_id, true, false).await?;
                self.circuit_breaker.record_error();
            }
            (_, Ok(ExecutionOutcome::Filled { .. })) => {
                self.store.mark_single_leg(&pair.pair_id, false, true).await?;
                self.circuit_breaker.record_error();
            }
            _ => {
                self.store.mark_closed(&pair.pair_id).await?;
                self.circuit_breaker.record_error();
                self.evaluator.record_execution_failure(&opportunity.symbol);
            }
        }

        Ok(())
    }

    /// Closes every leg of a held pair reduce-only, ahead of opening its
    /// replacement. Best-effort: an execution failure here still marks the
    /// pair closed, matching the Reconciler's own close-then-mark ordering,
    /// rather than leaving a half-closed pair stuck as COMPLETE.
    async fn close_pair_for_rotation(&self, pair: &HedgedPair, thread_id: &str) -> CoreResult<()> {
        let long_price = self.mark_price(pair.long_venue, &pair.symbol).await.unwrap_or(0.0);
        let short_price = self.mark_price(pair.short_venue, &pair.symbol).await.unwrap_or(0.0);
        let _ = self
            .executor
            .execute_leg(&pair.symbol, pair.long_venue, PositionSide::Long, pair.intended_size, long_price, true, thread_id)
            .await;
        let _ = self
            .executor
            .execute_leg(&pair.symbol, pair.short_venue, PositionSide::Short, pair.intended_size, short_price, true, thread_id)
            .await;
        self.store.mark_closed(&pair.pair_id).await?;
        Ok(())
    }

    /// Rotation per §4.4 rule 6: for each held COMPLETE pair, checks whether
    /// the best fresh candidate (already excluded from `candidates` if it
    /// shares the held pair's symbol, since `rank` filters those out) is
    /// worth the cost of closing the held pair and opening the candidate in
    /// its place. Both symbol locks are taken together to keep the close and
    /// the reopen atomic from any other cycle's point of view.
    async fn run_rotation_pass(&self, candidates: &[crate::evaluator::Opportunity], thread_id: &str) -> CoreResult<()> {
        let held_pairs = self.store.get_by_status(PairStatus::Complete).await;

        for pair in &held_pairs {
            let Some(candidate) = candidates.iter().find(|c| c.symbol != pair.symbol) else {
                continue;
            };

            let long_price = self.mark_price(pair.long_venue, &pair.symbol).await.unwrap_or(0.0);
            let notional = pair.intended_size * long_price.max(1.0);
            if notional <= 0.0 {
                continue;
            }

            let held_expected_return_usd_per_hour = pair.expected_return_percent_per_hour / 100.0 * notional;
            let current_break_even_hours = if held_expected_return_usd_per_hour > 0.0 {
                crate::evaluator::churn_cost_hours(ROTATION_FEE_RATE, ROTATION_FEE_RATE, notional, held_expected_return_usd_per_hour)
            } else {
                f64::INFINITY
            };
            let churn_cost_hours = crate::evaluator::churn_cost_hours(ROTATION_FEE_RATE, ROTATION_FEE_RATE, notional, candidate.expected_return_usd_per_hour);

            if !self.evaluator.should_rotate(current_break_even_hours, churn_cost_hours, candidate) {
                continue;
            }
            if !self.registry.try_acquire_two_symbol_locks(&pair.symbol, &candidate.symbol, thread_id, "rotation") {
                continue;
            }

            info!(from = %pair.symbol, to = %candidate.symbol, current_break_even_hours, churn_cost_hours, "rotation: closing held pair for a better opportunity");
            self.close_pair_for_rotation(pair, thread_id).await?;
            self.open_pair_locked(candidate, thread_id).await?;

            self.registry.release_symbol_lock(&pair.symbol, thread_id);
            self.registry.release_symbol_lock(&candidate.symbol, thread_id);
        }

        Ok(())
    }

    async fn find_opportunities(&self, active_pairs: &[HedgedPair]) -> CoreResult<Vec<crate::evaluator::Opportunity>> {
        let symbols: Vec<String> = if self.config.keeper_symbols.is_empty() {
            self.cache.get_all_positions().iter().map(|p| p.symbol.clone()).collect()
        } else {
            self.config.keeper_symbols.clone()
        };

        let mut candidates = Vec::new();
        for symbol in symbols {
            let mut quotes = Vec::new();
            for (venue, adapter) in &self.adapters {
                if let (Ok(mark_price), Ok(hourly_rate)) = (adapter.get_mark_price(&symbol).await, adapter.get_funding_rate(&symbol).await) {
                    quotes.push(FundingQuote {
                        venue: *venue,
                        hourly_rate,
                        mark_price,
                        fee_rate: 0.0002,
                    });
                }
            }
            if let Some(opportunity) = self.evaluator.evaluate_symbol(&symbol, &quotes, self.prediction.as_ref()).await {
                candidates.push(opportunity);
            }
        }

        Ok(self.evaluator.rank(candidates, active_pairs))
    }

    async fn log_portfolio_summary(&self) {
        let positions = self.cache.get_all_positions();
        let total_notional: f64 = positions.iter().map(|p| p.notional()).sum();
        info!(position_count = positions.len(), total_notional, "portfolio summary");
    }
}
