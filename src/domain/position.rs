use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

/// A single venue's view of one side of a hedged pair (or an unpaired leg).
///
/// Identity for diffing purposes is `(venue, symbol, side)` — see
/// `MarketStateCache` and the reconciler's phase A diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub venue: Venue,
    /// Already normalized — callers normalize at the adapter boundary.
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub liquidation_price: Option<f64>,
    pub margin_used: f64,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    pub fn is_dust(&self) -> bool {
        super::is_dust(self.size)
    }

    pub fn notional(&self) -> f64 {
        self.size.abs() * self.mark_price
    }
}
