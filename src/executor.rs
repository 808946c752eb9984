//! Order Executor: places one side of a hedged pair under the slot it has
//! reserved in the lock registry, then waits for a fill with exponential
//! backoff, repricing being left to the Guardian's asymmetric-fill recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{is_dust, OrderStatus, OrderType, PositionSide, TimeInForce, Venue};
use crate::error::{CoreError, CoreResult};
use crate::lock_registry::ExecutionLockRegistry;
use crate::venue::{OrderRequest, VenueAdapter};

const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled { filled_size: f64, average_fill_price: f64 },
    Failed { reason: String },
}

pub struct OrderExecutor {
    registry: Arc<ExecutionLockRegistry>,
    adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
    max_retries: u32,
    max_backoff_delay: Duration,
    backoff_base: Duration,
}

impl OrderExecutor {
    pub fn new(
        registry: Arc<ExecutionLockRegistry>,
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            adapters,
            max_retries: config.max_retries_executor,
            max_backoff_delay: config.max_backoff_delay_opening,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    #[cfg(test)]
    pub fn new_with_backoff_base(
        registry: Arc<ExecutionLockRegistry>,
        adapters: HashMap<Venue, Arc<dyn VenueAdapter>>,
        config: &Config,
        backoff_base: Duration,
    ) -> Self {
        Self {
            registry,
            adapters,
            max_retries: config.max_retries_executor,
            max_backoff_delay: config.max_backoff_delay_opening,
            backoff_base,
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = self.backoff_base.saturating_mul(1u32 << attempt.saturating_sub(1).min(20));
        scaled.min(self.max_backoff_delay)
    }

    /// Places one leg (venue, symbol, side) and drives it to a terminal
    /// state. `reduce_only` selects open vs. close semantics.
    pub async fn execute_leg(
        &self,
        symbol: &str,
        venue: Venue,
        side: PositionSide,
        size: f64,
        price: f64,
        reduce_only: bool,
        thread_id: &str,
    ) -> CoreResult<ExecutionOutcome> {
        let adapter = self
            .adapters
            .get(&venue)
            .ok_or_else(|| CoreError::InvariantViolation(format!("no adapter registered for venue {venue}")))?;

        self.registry.register_order_placing(symbol, venue, side, thread_id, size, price);

        let ack = match adapter
            .place_order(OrderRequest {
                symbol: symbol.to_string(),
                side,
                order_type: OrderType::Limit,
                size,
                price,
                tif: TimeInForce::Gtc,
                reduce_only,
            })
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                self.registry.update_order_status(venue, symbol, side, OrderStatus::Failed, None, None, None);
                return Ok(ExecutionOutcome::Failed { reason: err.to_string() });
            }
        };

        self.registry
            .update_order_status(venue, symbol, side, OrderStatus::WaitingFill, Some(&ack.order_id), Some(price), Some(reduce_only));

        if ack.status.is_filled() {
            self.registry.update_order_status(venue, symbol, side, OrderStatus::Filled, Some(&ack.order_id), None, None);
            return Ok(ExecutionOutcome::Filled {
                filled_size: ack.filled_size,
                average_fill_price: ack.average_fill_price,
            });
        }

        for attempt in 1..=self.max_retries {
            tokio::time::sleep(self.backoff_delay(attempt)).await;

            if let Some(outcome) = self.poll_once(adapter.as_ref(), symbol, venue, side, &ack.order_id).await? {
                return Ok(outcome);
            }
        }

        warn!(symbol, venue = %venue, side = ?side, thread_id, "executor timed out waiting for fill, cancelling");
        let _ = adapter.cancel_order(&ack.order_id, symbol).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        if let Some(outcome) = self.poll_once(adapter.as_ref(), symbol, venue, side, &ack.order_id).await? {
            return Ok(outcome);
        }

        self.registry.update_order_status(venue, symbol, side, OrderStatus::Cancelled, None, None, None);
        Ok(ExecutionOutcome::Failed {
            reason: "timed out waiting for fill".to_string(),
        })
    }

    async fn poll_once(
        &self,
        adapter: &dyn VenueAdapter,
        symbol: &str,
        venue: Venue,
        side: PositionSide,
        order_id: &str,
    ) -> CoreResult<Option<ExecutionOutcome>> {
        let positions = adapter.get_positions().await.unwrap_or_default();
        if let Some(position) = positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side && !is_dust(p.size))
        {
            self.registry.update_order_status(venue, symbol, side, OrderStatus::Filled, Some(order_id), None, None);
            return Ok(Some(ExecutionOutcome::Filled {
                filled_size: position.size,
                average_fill_price: position.entry_price,
            }));
        }

        match adapter.get_order_status(order_id, symbol).await {
            Ok(status) if status.status.is_filled() => {
                self.registry.update_order_status(venue, symbol, side, OrderStatus::Filled, Some(order_id), None, None);
                Ok(Some(ExecutionOutcome::Filled {
                    filled_size: status.filled_size,
                    average_fill_price: status.average_fill_price,
                }))
            }
            Ok(status) if matches!(status.status, OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired) => {
                self.registry.update_order_status(venue, symbol, side, status.status, Some(order_id), None, None);
                Ok(Some(ExecutionOutcome::Failed {
                    reason: format!("order ended in {:?}", status.status),
                }))
            }
            Ok(_) => Ok(None),
            Err(CoreError::OrderNotFound { .. }) => {
                info!(symbol, venue = %venue, "order not found on venue, treating as terminal");
                self.registry.force_clear_order(venue, symbol, side);
                Ok(Some(ExecutionOutcome::Failed {
                    reason: "order not found on venue".to_string(),
                }))
            }
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::mock::{FillScript, MockVenueAdapter};

    fn cfg() -> Config {
        std::env::remove_var("EXECUTOR_MAX_RETRIES");
        std::env::remove_var("MAX_BACKOFF_DELAY_OPENING_SECONDS");
        Config::from_env().unwrap()
    }

    fn executor_with(adapter: MockVenueAdapter) -> OrderExecutor {
        let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(adapter.venue(), Arc::new(adapter));
        OrderExecutor::new_with_backoff_base(
            Arc::new(ExecutionLockRegistry::new()),
            adapters,
            &cfg(),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn immediate_fill_returns_filled_outcome() {
        let adapter = MockVenueAdapter::new(Venue::Hl);
        adapter.set_mark_price("ETH", 100.0);
        let executor = executor_with(adapter);

        let outcome = executor
            .execute_leg("ETH", Venue::Hl, PositionSide::Long, 1.0, 100.0, false, "t1")
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Filled { filled_size, .. } => assert_eq!(filled_size, 1.0),
            ExecutionOutcome::Failed { reason } => panic!("expected fill, got failure: {reason}"),
        }
    }

    #[tokio::test]
    async fn reject_on_place_returns_failed_outcome() {
        let adapter = MockVenueAdapter::new(Venue::Hl);
        adapter.set_mark_price("ETH", 100.0);
        adapter.script_next_fill("ETH", PositionSide::Long, FillScript::RejectOnPlace);
        let executor = executor_with(adapter);

        let outcome = executor
            .execute_leg("ETH", Venue::Hl, PositionSide::Long, 1.0, 100.0, false, "t1")
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn never_fill_times_out_to_failed_after_cancel() {
        let adapter = MockVenueAdapter::new(Venue::Hl);
        adapter.set_mark_price("ETH", 100.0);
        adapter.script_next_fill("ETH", PositionSide::Long, FillScript::NeverFill);
        let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(Venue::Hl, Arc::new(adapter));
        let mut cfg = cfg();
        cfg.max_retries_executor = 2;
        let executor = OrderExecutor::new_with_backoff_base(
            Arc::new(ExecutionLockRegistry::new()),
            adapters,
            &cfg,
            Duration::from_millis(5),
        );

        let outcome = executor
            .execute_leg("ETH", Venue::Hl, PositionSide::Long, 1.0, 100.0, false, "t1")
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
    }

    #[test]
    fn backoff_delay_doubles_and_is_capped() {
        let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
        adapters.insert(Venue::Hl, Arc::new(MockVenueAdapter::new(Venue::Hl)));
        let mut cfg = cfg();
        cfg.max_backoff_delay_opening = Duration::from_secs(10);
        let executor = OrderExecutor::new(Arc::new(ExecutionLockRegistry::new()), adapters, &cfg);
        assert_eq!(executor.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(executor.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(executor.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(executor.backoff_delay(4), Duration::from_secs(10));
    }
}
