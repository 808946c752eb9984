//! Funding-rate prediction service contract. A real implementation is an
//! external collaborator (historical funding-rate model, ML service, or a
//! simple EWMA); this crate only needs the interface the Evaluator and
//! Reconciler drive it through.

use async_trait::async_trait;

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy)]
pub struct SpreadPrediction {
    /// Predicted (short-rate − long-rate) per funding period, as a fraction.
    pub predicted_spread: f64,
    /// 0..=1 confidence used to break ranking ties.
    pub confidence: f64,
    /// Expected hours until the basis reverts enough to no longer be worth holding.
    pub reversion_horizon_hours: f64,
}

#[async_trait]
pub trait PredictionService: Send + Sync {
    async fn predict(&self, symbol: &str) -> CoreResult<SpreadPrediction>;
}

/// Deterministic stand-in used by tests and local runs: treats the
/// most-recent observed spread as the prediction, with a fixed horizon.
pub struct NaivePredictionService;

#[async_trait]
impl PredictionService for NaivePredictionService {
    async fn predict(&self, _symbol: &str) -> CoreResult<SpreadPrediction> {
        Ok(SpreadPrediction {
            predicted_spread: 0.0,
            confidence: 0.5,
            reversion_horizon_hours: 24.0,
        })
    }
}

#[cfg(test)]
pub struct ScriptedPredictionService {
    pub spread: f64,
    pub confidence: f64,
    pub reversion_horizon_hours: f64,
}

#[cfg(test)]
#[async_trait]
impl PredictionService for ScriptedPredictionService {
    async fn predict(&self, _symbol: &str) -> CoreResult<SpreadPrediction> {
        Ok(SpreadPrediction {
            predicted_spread: self.spread,
            confidence: self.confidence,
            reversion_horizon_hours: self.reversion_horizon_hours,
        })
    }
}
