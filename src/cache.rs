//! Market-State Cache: the single refreshed snapshot of positions and mark
//! prices every other component reads from during a tick, so two components
//! never see a different view of the world mid-cycle.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::warn;

use crate::domain::{is_dust, Position, Venue};
use crate::venue::VenueAdapter;

#[derive(Default)]
struct Snapshot {
    positions: HashMap<(Venue, String), Position>,
    mark_prices: HashMap<(Venue, String), f64>,
}

/// Fans out to every adapter concurrently on `refresh_all`; a single venue
/// erroring does not block the others — its half of the snapshot is simply
/// left stale until the next successful refresh.
pub struct MarketStateCache {
    adapters: Vec<Arc<dyn VenueAdapter>>,
    snapshot: RwLock<Snapshot>,
}

impl MarketStateCache {
    pub fn new(adapters: Vec<Arc<dyn VenueAdapter>>) -> Self {
        Self {
            adapters,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    pub async fn refresh_all(&self) {
        let mut set = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = Arc::clone(adapter);
            set.spawn(async move { (adapter.venue(), adapter.get_positions().await) });
        }

        let mut results = Vec::with_capacity(self.adapters.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(join_err) => warn!(error = %join_err, "cache refresh task panicked"),
            }
        }

        let mut snapshot = self.snapshot.write();
        for (venue, result) in results {
            match result {
                Ok(positions) => {
                    snapshot.positions.retain(|(v, _), _| *v != venue);
                    for position in positions.into_iter().filter(|p| !is_dust(p.size)) {
                        snapshot
                            .mark_prices
                            .insert((venue, position.symbol.clone()), position.mark_price);
                        snapshot
                            .positions
                            .insert((venue, position.symbol.clone()), position);
                    }
                }
                Err(err) => {
                    warn!(venue = %venue, error = %err, "cache refresh failed, keeping stale snapshot for venue");
                }
            }
        }
    }

    pub fn get_all_positions(&self) -> Vec<Position> {
        self.snapshot.read().positions.values().cloned().collect()
    }

    pub fn get_position(&self, venue: Venue, symbol: &str) -> Option<Position> {
        self.snapshot
            .read()
            .positions
            .get(&(venue, symbol.to_string()))
            .cloned()
    }

    pub fn update_position(&self, position: Position) {
        let mut snapshot = self.snapshot.write();
        if is_dust(position.size) {
            snapshot
                .positions
                .remove(&(position.venue, position.symbol.clone()));
        } else {
            snapshot
                .mark_prices
                .insert((position.venue, position.symbol.clone()), position.mark_price);
            snapshot
                .positions
                .insert((position.venue, position.symbol.clone()), position);
        }
    }

    pub fn remove_position(&self, venue: Venue, symbol: &str) {
        self.snapshot
            .write()
            .positions
            .remove(&(venue, symbol.to_string()));
    }

    pub fn get_mark_price(&self, venue: Venue, symbol: &str) -> Option<f64> {
        self.snapshot
            .read()
            .mark_prices
            .get(&(venue, symbol.to_string()))
            .copied()
    }

    pub fn set_mark_price(&self, venue: Venue, symbol: &str, price: f64) {
        self.snapshot
            .write()
            .mark_prices
            .insert((venue, symbol.to_string()), price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PositionSide;
    use crate::venue::mock::MockVenueAdapter;

    fn sample_position(venue: Venue, symbol: &str, size: f64) -> Position {
        Position {
            venue,
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            size,
            entry_price: 100.0,
            mark_price: 101.0,
            unrealized_pnl: 0.0,
            leverage: 2.0,
            liquidation_price: None,
            margin_used: 50.0,
            last_updated: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn refresh_all_populates_from_every_adapter() {
        let hl = MockVenueAdapter::new(Venue::Hl);
        hl.seed_position(sample_position(Venue::Hl, "ETH", 1.0));
        let l = MockVenueAdapter::new(Venue::L);
        l.seed_position(sample_position(Venue::L, "ETH", -1.0));

        let cache = MarketStateCache::new(vec![Arc::new(hl), Arc::new(l)]);
        cache.refresh_all().await;

        let positions = cache.get_all_positions();
        assert_eq!(positions.len(), 2);
        assert!(cache.get_position(Venue::Hl, "ETH").is_some());
        assert!(cache.get_position(Venue::L, "ETH").is_some());
    }

    #[tokio::test]
    async fn dust_positions_are_filtered_on_refresh() {
        let hl = MockVenueAdapter::new(Venue::Hl);
        hl.seed_position(sample_position(Venue::Hl, "ETH", 0.00001));
        let cache = MarketStateCache::new(vec![Arc::new(hl)]);
        cache.refresh_all().await;
        assert!(cache.get_all_positions().is_empty());
    }

    #[tokio::test]
    async fn update_position_with_dust_size_removes_it() {
        let cache = MarketStateCache::new(vec![]);
        cache.update_position(sample_position(Venue::Hl, "ETH", 1.0));
        assert!(cache.get_position(Venue::Hl, "ETH").is_some());
        cache.update_position(sample_position(Venue::Hl, "ETH", 0.0));
        assert!(cache.get_position(Venue::Hl, "ETH").is_none());
    }
}
