use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PositionSide, Venue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Placing,
    WaitingFill,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Failed
        )
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, OrderStatus::Filled)
    }
}

/// An order as tracked by the execution-lock registry. `order_id` is assigned
/// by the venue once accepted and is absent while the order is still PLACING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Option<String>,
    pub venue: Venue,
    pub symbol: String,
    pub side: PositionSide,
    pub order_type: OrderType,
    pub size: f64,
    pub price: f64,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub placed_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub average_fill_price: f64,
    /// Identifies the execution thread (scheduler tick) that placed this
    /// order — the Guardian groups orders by this to find asymmetric fills.
    pub thread_id: String,
}

impl Order {
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.placed_at
    }
}
