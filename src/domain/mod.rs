//! Shared data model for the coordination core: venues, symbols, positions,
//! orders, and the hedged-pair intent record.

mod hedged_pair;
mod order;
mod position;
mod symbol;

pub use hedged_pair::{HedgedPair, PairStatus};
pub use order::{Order, OrderStatus, OrderType, TimeInForce};
pub use position::{Position, PositionSide};
pub use symbol::normalize_symbol;

use serde::{Deserialize, Serialize};
use std::fmt;

/// A finite set of supported perp venues. Real adapters are an external
/// collaborator; this core only needs a stable identity to key state by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Venue {
    /// Hyperliquid
    Hl,
    /// Lighter
    L,
    /// Aevo (or any third venue — kept generic on purpose)
    A,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Hl => "HL",
            Venue::L => "L",
            Venue::A => "A",
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dust threshold below which a position is never returned by the cache and
/// is never treated as "present" by the reconciler.
pub const DUST_THRESHOLD: f64 = 0.0001;

pub fn is_dust(size: f64) -> bool {
    size.abs() <= DUST_THRESHOLD
}
