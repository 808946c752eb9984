//! Venue adapter contract. Real per-venue REST/WebSocket implementations,
//! auth signing, and symbol-metadata discovery are external collaborators —
//! this module only specifies the interface the core drives.

pub mod mock;

use async_trait::async_trait;

use crate::domain::{Order, OrderType, PositionSide, Position, TimeInForce, Venue};
use crate::error::CoreResult;

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub order_type: OrderType,
    pub size: f64,
    pub price: f64,
    pub tif: TimeInForce,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub status: crate::domain::OrderStatus,
    pub filled_size: f64,
    pub average_fill_price: f64,
}

/// Uniform contract for one exchange: orders, positions, balances, marks,
/// open orders, cancels. Implementations own their own signing/auth and
/// retry-on-transient-error behavior; by the time an error crosses this
/// trait boundary it should already be `CoreError::TransientVenue` only if
/// retries were exhausted.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    async fn place_order(&self, request: OrderRequest) -> CoreResult<OrderAck>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> CoreResult<bool>;
    async fn cancel_all_orders(&self, symbol: &str) -> CoreResult<()>;
    async fn get_order_status(&self, order_id: &str, symbol: &str) -> CoreResult<OrderAck>;
    async fn get_positions(&self) -> CoreResult<Vec<Position>>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> CoreResult<Vec<Order>>;
    async fn get_balance(&self) -> CoreResult<f64>;
    async fn get_equity(&self) -> CoreResult<f64>;
    async fn get_mark_price(&self, symbol: &str) -> CoreResult<f64>;

    /// Current funding rate for one symbol, as a fraction per funding
    /// period. The wire format and epoch length are venue-specific; the
    /// real per-venue adapter normalizes both before returning here.
    async fn get_funding_rate(&self, symbol: &str) -> CoreResult<f64>;

    /// Best-effort order amend; adapters that don't support it fall back to
    /// cancel-and-replace at the call site.
    async fn modify_order(&self, _order_id: &str, _request: OrderRequest) -> CoreResult<OrderAck> {
        Err(crate::error::CoreError::InvariantViolation(
            "modify_order not supported by this adapter".into(),
        ))
    }

    /// Policy for on-chain/internal rebalancing transfers is out of scope;
    /// the interface is kept so a future policy can use it without a trait
    /// break. No core component calls this today.
    async fn deposit_external(&self, _amount_usd: f64, _asset: &str) -> CoreResult<()> {
        Ok(())
    }

    fn clear_position_cache(&self) {}
}
