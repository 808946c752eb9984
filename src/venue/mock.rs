//! In-memory venue adapter used by integration tests to drive the core
//! end-to-end without a network. Mirrors the shape of a paper-trading
//! execution adapter: it fills orders according to a small, per-symbol
//! programmable script rather than talking to a real matching engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{Order, OrderStatus, Position, PositionSide, Venue};
use crate::error::{CoreError, CoreResult};
use crate::venue::{OrderAck, OrderRequest, VenueAdapter};

/// Scripted behavior for one (symbol, side) the mock should exhibit on the
/// *next* `place_order` call for that key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillScript {
    /// Order fills immediately at the requested price.
    FillImmediately,
    /// Order is accepted but never fills (stays WAITING_FILL) until a test
    /// manually advances it with `complete_fill`.
    NeverFill,
    /// place_order itself fails, as if the venue rejected the request.
    RejectOnPlace,
}

struct MockState {
    positions: Vec<Position>,
    mark_prices: HashMap<String, f64>,
    funding_rates: HashMap<String, f64>,
    open_orders: Vec<Order>,
    scripts: HashMap<(String, PositionSide), FillScript>,
    balance: f64,
    equity: f64,
}

/// A single venue's mock adapter. Construct one per venue and register the
/// symbols/marks the scenario needs before handing it to the core.
#[derive(Clone)]
pub struct MockVenueAdapter {
    venue: Venue,
    state: Arc<Mutex<MockState>>,
    next_order_id: Arc<AtomicU64>,
}

impl MockVenueAdapter {
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            state: Arc::new(Mutex::new(MockState {
                positions: Vec::new(),
                mark_prices: HashMap::new(),
                funding_rates: HashMap::new(),
                open_orders: Vec::new(),
                scripts: HashMap::new(),
                balance: 10_000.0,
                equity: 10_000.0,
            })),
            next_order_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_balance(self, balance: f64) -> Self {
        self.state.lock().balance = balance;
        self.state.lock().equity = balance;
        self
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        self.state
            .lock()
            .mark_prices
            .insert(symbol.to_string(), price);
    }

    pub fn set_funding_rate(&self, symbol: &str, hourly_rate: f64) {
        self.state
            .lock()
            .funding_rates
            .insert(symbol.to_string(), hourly_rate);
    }

    pub fn script_next_fill(&self, symbol: &str, side: PositionSide, script: FillScript) {
        self.state
            .lock()
            .scripts
            .insert((symbol.to_string(), side), script);
    }

    pub fn seed_position(&self, position: Position) {
        self.state.lock().positions.push(position);
    }

    pub fn remove_position(&self, symbol: &str, side: PositionSide) {
        self.state
            .lock()
            .positions
            .retain(|p| !(p.symbol == symbol && p.side == side));
    }

    fn next_id(&self) -> String {
        let n = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        format!("mock-{}-{}", self.venue.as_str(), n)
    }
}

#[async_trait]
impl VenueAdapter for MockVenueAdapter {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn place_order(&self, request: OrderRequest) -> CoreResult<OrderAck> {
        let mut state = self.state.lock();
        let script = state
            .scripts
            .remove(&(request.symbol.clone(), request.side))
            .unwrap_or(FillScript::FillImmediately);

        let order_id = self.next_id();

        match script {
            FillScript::RejectOnPlace => Err(CoreError::TransientVenue {
                venue: self.venue.as_str().into(),
                message: "mock venue rejected order".into(),
            }),
            FillScript::FillImmediately => {
                let mark = *state.mark_prices.get(&request.symbol).unwrap_or(&request.price);
                state.positions.retain(|p| {
                    !(p.symbol == request.symbol && p.side == request.side && !request.reduce_only)
                });
                if !request.reduce_only {
                    state.positions.push(Position {
                        venue: self.venue,
                        symbol: request.symbol.clone(),
                        side: request.side,
                        size: request.size,
                        entry_price: request.price,
                        mark_price: mark,
                        unrealized_pnl: 0.0,
                        leverage: 1.0,
                        liquidation_price: None,
                        margin_used: request.size * request.price,
                        last_updated: chrono::Utc::now(),
                    });
                } else {
                    // reduce-only close: drop (or shrink) the matching leg
                    for p in state.positions.iter_mut() {
                        if p.symbol == request.symbol && p.side == request.side {
                            p.size = (p.size - request.size).max(0.0);
                        }
                    }
                    state.positions.retain(|p| !p.is_dust());
                }
                Ok(OrderAck {
                    order_id,
                    status: OrderStatus::Filled,
                    filled_size: request.size,
                    average_fill_price: request.price,
                })
            }
            FillScript::NeverFill => {
                state.open_orders.push(Order {
                    order_id: Some(order_id.clone()),
                    venue: self.venue,
                    symbol: request.symbol,
                    side: request.side,
                    order_type: request.order_type,
                    size: request.size,
                    price: request.price,
                    tif: request.tif,
                    reduce_only: request.reduce_only,
                    placed_at: chrono::Utc::now(),
                    status: OrderStatus::WaitingFill,
                    filled_size: 0.0,
                    average_fill_price: 0.0,
                    thread_id: "mock".into(),
                });
                Ok(OrderAck {
                    order_id,
                    status: OrderStatus::WaitingFill,
                    filled_size: 0.0,
                    average_fill_price: 0.0,
                })
            }
        }
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> CoreResult<bool> {
        let mut state = self.state.lock();
        let before = state.open_orders.len();
        state
            .open_orders
            .retain(|o| o.order_id.as_deref() != Some(order_id));
        Ok(state.open_orders.len() < before)
    }

    async fn cancel_all_orders(&self, symbol: &str) -> CoreResult<()> {
        self.state.lock().open_orders.retain(|o| o.symbol != symbol);
        Ok(())
    }

    async fn get_order_status(&self, order_id: &str, _symbol: &str) -> CoreResult<OrderAck> {
        let state = self.state.lock();
        match state.open_orders.iter().find(|o| o.order_id.as_deref() == Some(order_id)) {
            Some(o) => Ok(OrderAck {
                order_id: order_id.to_string(),
                status: o.status,
                filled_size: o.filled_size,
                average_fill_price: o.average_fill_price,
            }),
            None => Err(CoreError::OrderNotFound {
                venue: self.venue.as_str().into(),
                order_id: order_id.into(),
            }),
        }
    }

    async fn get_positions(&self) -> CoreResult<Vec<Position>> {
        Ok(self
            .state
            .lock()
            .positions
            .iter()
            .filter(|p| !p.is_dust())
            .cloned()
            .collect())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> CoreResult<Vec<Order>> {
        let state = self.state.lock();
        Ok(state
            .open_orders
            .iter()
            .filter(|o| symbol.map(|s| s == o.symbol).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_balance(&self) -> CoreResult<f64> {
        Ok(self.state.lock().balance)
    }

    async fn get_equity(&self) -> CoreResult<f64> {
        Ok(self.state.lock().equity)
    }

    async fn get_mark_price(&self, symbol: &str) -> CoreResult<f64> {
        self.state
            .lock()
            .mark_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| CoreError::InvariantViolation(format!("no mark price seeded for {symbol}")))
    }

    async fn get_funding_rate(&self, symbol: &str) -> CoreResult<f64> {
        Ok(self.state.lock().funding_rates.get(symbol).copied().unwrap_or(0.0))
    }
}
