//! Opportunity Evaluator: ranks candidate cross-venue funding-rate spreads
//! against current holdings and decides whether an existing pair should be
//! rotated into a better one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::config::Config;
use crate::domain::{normalize_symbol, HedgedPair, PairStatus, Venue};
use crate::prediction::PredictionService;

/// One venue's observed funding rate for a symbol, as a fraction per funding period.
#[derive(Debug, Clone, Copy)]
pub struct FundingQuote {
    pub venue: Venue,
    pub hourly_rate: f64,
    pub mark_price: f64,
    pub fee_rate: f64,
}

#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub long_venue: Venue,
    pub short_venue: Venue,
    pub spread_per_hour: f64,
    pub expected_return_usd_per_hour: f64,
    pub confidence: f64,
    pub break_even_hours: f64,
}

struct QualityEntry {
    failure_count: u32,
    blacklisted_until: Option<Instant>,
}

struct CooldownEntry {
    started_at: Instant,
    captured_profit_percent: f64,
    exit_basis: f64,
}

const DYNAMIC_BLACKLIST_THRESHOLD: u32 = 3;
const DYNAMIC_BLACKLIST_TTL: Duration = Duration::from_secs(6 * 3600);

/// Stateful ranking/filtering engine. Cheap to share behind an `Arc`: all
/// mutable state is behind `parking_lot::Mutex` guarding plain maps.
pub struct OpportunityEvaluator {
    config: Config,
    quality: Mutex<HashMap<String, QualityEntry>>,
    profit_take_cooldowns: Mutex<HashMap<String, CooldownEntry>>,
}

impl OpportunityEvaluator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            quality: Mutex::new(HashMap::new()),
            profit_take_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Static + dynamic blacklist check. Always re-checked right before
    /// execution, not only at discovery time.
    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        let normalized = normalize_symbol(symbol);
        if self.config.is_blacklisted(&normalized) {
            return true;
        }
        match self.quality.lock().get(&normalized) {
            Some(entry) => entry
                .blacklisted_until
                .map(|until| Instant::now() < until)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Records an execution failure for the dynamic quality filter; once a
    /// symbol crosses the threshold it is auto-blacklisted for a fixed TTL.
    pub fn record_execution_failure(&self, symbol: &str) {
        let normalized = normalize_symbol(symbol);
        let mut quality = self.quality.lock();
        let entry = quality.entry(normalized.clone()).or_insert(QualityEntry {
            failure_count: 0,
            blacklisted_until: None,
        });
        entry.failure_count += 1;
        if entry.failure_count >= DYNAMIC_BLACKLIST_THRESHOLD {
            entry.blacklisted_until = Some(Instant::now() + DYNAMIC_BLACKLIST_TTL);
            info!(symbol = %normalized, "auto-blacklisted by dynamic quality filter");
        }
    }

    /// Admin override: force-blacklist regardless of failure history.
    pub fn force_blacklist(&self, symbol: &str) {
        let normalized = normalize_symbol(symbol);
        self.quality.lock().insert(
            normalized,
            QualityEntry {
                failure_count: DYNAMIC_BLACKLIST_THRESHOLD,
                blacklisted_until: Some(Instant::now() + DYNAMIC_BLACKLIST_TTL),
            },
        );
    }

    /// Admin override: clear any dynamic blacklist entry (static config
    /// blacklist is unaffected).
    pub fn force_unblacklist(&self, symbol: &str) {
        self.quality.lock().remove(&normalize_symbol(symbol));
    }

    /// Registers a profit-take cooldown after a ≥50% partial close, per §4.4 rule 4.
    pub fn register_profit_take_cooldown(&self, symbol: &str, captured_profit_percent: f64, exit_basis: f64) {
        let normalized = normalize_symbol(symbol);
        self.profit_take_cooldowns.lock().insert(
            normalized,
            CooldownEntry {
                started_at: Instant::now(),
                captured_profit_percent,
                exit_basis,
            },
        );
    }

    /// True while a symbol is excluded from new-pair search following a
    /// recent profit-take, until either the cooldown window elapses or the
    /// basis reverts by at least half of what was captured.
    pub fn is_in_profit_take_cooldown(&self, symbol: &str, current_basis: f64) -> bool {
        let normalized = normalize_symbol(symbol);
        let cooldowns = self.profit_take_cooldowns.lock();
        match cooldowns.get(&normalized) {
            None => false,
            Some(entry) => {
                let elapsed_hours = entry.started_at.elapsed().as_secs_f64() / 3600.0;
                if elapsed_hours >= self.config.profit_take_cooldown_hours {
                    return false;
                }
                let reverted = (current_basis - entry.exit_basis).abs();
                let half_captured = entry.captured_profit_percent.abs() * 0.5;
                reverted < half_captured
            }
        }
    }

    /// Builds the ranked opportunity list for one symbol from the venues
    /// quoting it (at least two required). Picks the lowest-rate venue to go
    /// long and the highest-rate venue to go short.
    pub async fn evaluate_symbol(
        &self,
        symbol: &str,
        quotes: &[FundingQuote],
        prediction_service: &dyn PredictionService,
    ) -> Option<Opportunity> {
        let normalized = normalize_symbol(symbol);
        if self.is_blacklisted(&normalized) || quotes.len() < 2 {
            return None;
        }

        let long_quote = quotes.iter().min_by(|a, b| a.hourly_rate.total_cmp(&b.hourly_rate))?;
        let short_quote = quotes
            .iter()
            .filter(|q| q.venue != long_quote.venue)
            .max_by(|a, b| a.hourly_rate.total_cmp(&b.hourly_rate))?;

        let spread_per_hour = short_quote.hourly_rate - long_quote.hourly_rate;
        if spread_per_hour < self.config.min_spread {
            return None;
        }

        let prediction = prediction_service.predict(&normalized).await.ok()?;
        let notional = self.config.max_position_size_usd;
        let expected_return_usd_per_hour = spread_per_hour * notional;
        let churn_cost_hours = churn_cost_hours(long_quote.fee_rate, short_quote.fee_rate, notional, expected_return_usd_per_hour);
        let break_even_hours = if expected_return_usd_per_hour > 0.0 {
            churn_cost_hours
        } else {
            f64::INFINITY
        };

        Some(Opportunity {
            symbol: normalized,
            long_venue: long_quote.venue,
            short_venue: short_quote.venue,
            spread_per_hour,
            expected_return_usd_per_hour,
            confidence: prediction.confidence,
            break_even_hours,
        })
    }

    /// Ranks a batch of already-evaluated candidates by expected USD return,
    /// breaking ties by confidence, and excludes symbols with an existing
    /// COMPLETE pair (rotation is a separate path).
    pub fn rank(&self, mut candidates: Vec<Opportunity>, existing_pairs: &[HedgedPair]) -> Vec<Opportunity> {
        let held: std::collections::HashSet<&str> = existing_pairs
            .iter()
            .filter(|p| p.status == PairStatus::Complete)
            .map(|p| p.symbol.as_str())
            .collect();
        candidates.retain(|c| !held.contains(c.symbol.as_str()));
        candidates.sort_by(|a, b| {
            b.expected_return_usd_per_hour
                .total_cmp(&a.expected_return_usd_per_hour)
                .then(b.confidence.total_cmp(&a.confidence))
        });
        candidates
    }

    /// Rotation decision per §4.4 rule 6. `churn_cost_hours` is the round-trip
    /// fee cost of closing the held pair and opening the candidate,
    /// expressed in hours of the candidate's expected spread income.
    pub fn should_rotate(&self, current_break_even_hours: f64, churn_cost_hours: f64, candidate: &Opportunity) -> bool {
        (candidate.break_even_hours + churn_cost_hours)
            < (current_break_even_hours - self.config.rotation_min_hours_saved)
    }
}

/// Churn cost expressed in hours of expected spread income: the round-trip
/// fee cost of closing the old pair and opening the new one, divided by the
/// new pair's expected hourly USD return. `pub(crate)` so the rotation pass
/// in `orchestrator.rs` can reuse the same fee-cost model rather than
/// inventing a second one.
pub(crate) fn churn_cost_hours(long_fee_rate: f64, short_fee_rate: f64, notional: f64, expected_return_usd_per_hour: f64) -> f64 {
    if expected_return_usd_per_hour <= 0.0 {
        return f64::INFINITY;
    }
    let churn_cost_usd = (long_fee_rate + short_fee_rate) * notional * 2.0;
    churn_cost_usd / expected_return_usd_per_hour
}
