//! Execution-Lock Registry: the single process-wide coordinator for the
//! global lock, per-symbol locks, per-(venue, symbol, side) order slots, and
//! a ring buffer of recent order history.
//!
//! Acquisition is non-blocking (try-only, matching `parking_lot`'s
//! `try_lock` semantics): a failed acquire returns `false` and the caller
//! must abort that tick gracefully rather than block.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::{Order, OrderStatus, PositionSide, Venue};

const ORDER_HISTORY_CAPACITY: usize = 512;

struct Inner {
    global_lock_holder: Option<String>,
    symbol_locks: HashMap<String, String>, // symbol -> thread_id holding it
    order_slots: HashMap<(Venue, String, PositionSide), Order>,
    order_history: VecDeque<Order>,
    execution_completed_at: HashMap<String, Instant>,
}

/// A RAII guard that releases the global lock on drop, including on panic —
/// callers should hold this for the duration of a supervisory tick rather
/// than calling `release_global_lock` manually.
pub struct GlobalLockGuard<'a> {
    registry: &'a ExecutionLockRegistry,
    thread_id: String,
    released: bool,
}

impl<'a> Drop for GlobalLockGuard<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release_global_lock(&self.thread_id);
        }
    }
}

pub struct ExecutionLockRegistry {
    inner: Mutex<Inner>,
}

impl Default for ExecutionLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLockRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                global_lock_holder: None,
                symbol_locks: HashMap::new(),
                order_slots: HashMap::new(),
                order_history: VecDeque::with_capacity(ORDER_HISTORY_CAPACITY),
                execution_completed_at: HashMap::new(),
            }),
        }
    }

    /// Tries to take the global lock. Returns a guard on success; the caller
    /// must keep the guard alive for the duration of the exclusive section.
    pub fn try_acquire_global_lock(&self, thread_id: &str, reason: &str) -> Option<GlobalLockGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.global_lock_holder.is_some() {
            debug!(thread_id, reason, "global lock busy");
            return None;
        }
        inner.global_lock_holder = Some(thread_id.to_string());
        debug!(thread_id, reason, "global lock acquired");
        Some(GlobalLockGuard {
            registry: self,
            thread_id: thread_id.to_string(),
            released: false,
        })
    }

    fn release_global_lock(&self, thread_id: &str) {
        let mut inner = self.inner.lock();
        if inner.global_lock_holder.as_deref() == Some(thread_id) {
            inner.global_lock_holder = None;
            debug!(thread_id, "global lock released");
        }
    }

    pub fn is_global_lock_held(&self) -> bool {
        self.inner.lock().global_lock_holder.is_some()
    }

    pub fn try_acquire_symbol_lock(&self, symbol: &str, thread_id: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some(holder) = inner.symbol_locks.get(symbol) {
            if holder != thread_id {
                debug!(symbol, thread_id, reason, held_by = %holder, "symbol lock busy");
                return false;
            }
            return true;
        }
        inner.symbol_locks.insert(symbol.to_string(), thread_id.to_string());
        debug!(symbol, thread_id, reason, "symbol lock acquired");
        true
    }

    pub fn release_symbol_lock(&self, symbol: &str, thread_id: &str) {
        let mut inner = self.inner.lock();
        if inner.symbol_locks.get(symbol).map(|s| s.as_str()) == Some(thread_id) {
            inner.symbol_locks.remove(symbol);
            inner.execution_completed_at.insert(symbol.to_string(), Instant::now());
            debug!(symbol, thread_id, "symbol lock released");
        }
    }

    pub fn is_symbol_locked(&self, symbol: &str) -> bool {
        self.inner.lock().symbol_locks.contains_key(symbol)
    }

    /// Acquires two symbol locks in lexicographic order to avoid deadlock
    /// with any other caller that also sorts before acquiring (the rotation
    /// engine is the only component that needs two at once).
    pub fn try_acquire_two_symbol_locks(
        &self,
        a: &str,
        b: &str,
        thread_id: &str,
        reason: &str,
    ) -> bool {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        if !self.try_acquire_symbol_lock(first, thread_id, reason) {
            return false;
        }
        if !self.try_acquire_symbol_lock(second, thread_id, reason) {
            self.release_symbol_lock(first, thread_id);
            return false;
        }
        true
    }

    pub fn register_order_placing(
        &self,
        symbol: &str,
        venue: Venue,
        side: PositionSide,
        thread_id: &str,
        size: f64,
        price: f64,
    ) {
        let mut inner = self.inner.lock();
        let order = Order {
            order_id: None,
            venue,
            symbol: symbol.to_string(),
            side,
            order_type: crate::domain::OrderType::Limit,
            size,
            price,
            tif: crate::domain::TimeInForce::Gtc,
            reduce_only: false,
            placed_at: chrono::Utc::now(),
            status: OrderStatus::Placing,
            filled_size: 0.0,
            average_fill_price: 0.0,
            thread_id: thread_id.to_string(),
        };
        inner
            .order_slots
            .insert((venue, symbol.to_string(), side), order);
    }

    pub fn update_order_status(
        &self,
        venue: Venue,
        symbol: &str,
        side: PositionSide,
        status: OrderStatus,
        order_id: Option<&str>,
        price: Option<f64>,
        reduce_only: Option<bool>,
    ) {
        let mut inner = self.inner.lock();
        let key = (venue, symbol.to_string(), side);
        if let Some(order) = inner.order_slots.get_mut(&key) {
            order.status = status;
            if let Some(id) = order_id {
                order.order_id = Some(id.to_string());
            }
            if let Some(p) = price {
                order.price = p;
            }
            if let Some(ro) = reduce_only {
                order.reduce_only = ro;
            }
            if status.is_terminal() {
                let finished = inner.order_slots.remove(&key).unwrap();
                if inner.order_history.len() >= ORDER_HISTORY_CAPACITY {
                    inner.order_history.pop_front();
                }
                inner.order_history.push_back(finished);
            }
        }
    }

    pub fn has_active_order(&self, venue: Venue, symbol: &str, side: PositionSide) -> bool {
        self.inner
            .lock()
            .order_slots
            .contains_key(&(venue, symbol.to_string(), side))
    }

    pub fn get_all_active_orders(&self) -> Vec<Order> {
        self.inner.lock().order_slots.values().cloned().collect()
    }

    pub fn get_orders_older_than(&self, age: Duration) -> Vec<Order> {
        let chrono_age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero());
        self.inner
            .lock()
            .order_slots
            .values()
            .filter(|o| o.age() > chrono_age)
            .cloned()
            .collect()
    }

    /// Emergency cleanup: drops the slot regardless of its status. Used by
    /// zombie-order cleanup once the venue confirms the order is gone.
    pub fn force_clear_order(&self, venue: Venue, symbol: &str, side: PositionSide) {
        let mut inner = self.inner.lock();
        if inner
            .order_slots
            .remove(&(venue, symbol.to_string(), side))
            .is_some()
        {
            warn!(venue = %venue, symbol, side = ?side, "force-cleared order slot");
        }
    }

    pub fn is_in_execution_cooldown(&self, symbol: &str, window: Duration) -> bool {
        match self.get_execution_completed_at(symbol) {
            Some(completed) => completed.elapsed() < window,
            None => false,
        }
    }

    pub fn get_execution_completed_at(&self, symbol: &str) -> Option<Instant> {
        self.inner.lock().execution_completed_at.get(symbol).copied()
    }

    #[cfg(test)]
    pub fn order_history_len(&self) -> usize {
        self.inner.lock().order_history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_lock_is_exclusive() {
        let reg = ExecutionLockRegistry::new();
        let guard = reg.try_acquire_global_lock("t1", "main-cycle");
        assert!(guard.is_some());
        assert!(reg.try_acquire_global_lock("t2", "guardian").is_none());
        drop(guard);
        assert!(!reg.is_global_lock_held());
    }

    #[test]
    fn global_lock_reacquire_after_release_same_holder() {
        let reg = ExecutionLockRegistry::new();
        {
            let _g = reg.try_acquire_global_lock("t1", "tick").unwrap();
        }
        assert!(reg.try_acquire_global_lock("t1", "tick").is_some());
    }

    #[test]
    fn symbol_lock_excludes_other_threads() {
        let reg = ExecutionLockRegistry::new();
        assert!(reg.try_acquire_symbol_lock("ETH", "t1", "open"));
        assert!(!reg.try_acquire_symbol_lock("ETH", "t2", "rotate"));
        reg.release_symbol_lock("ETH", "t1");
        assert!(reg.try_acquire_symbol_lock("ETH", "t2", "rotate"));
    }

    #[test]
    fn two_symbol_locks_acquire_in_lexicographic_order() {
        let reg = ExecutionLockRegistry::new();
        assert!(reg.try_acquire_two_symbol_locks("SOL", "ETH", "t1", "rotation"));
        assert!(reg.is_symbol_locked("ETH"));
        assert!(reg.is_symbol_locked("SOL"));
    }

    #[test]
    fn two_symbol_lock_acquire_backs_out_on_partial_failure() {
        let reg = ExecutionLockRegistry::new();
        assert!(reg.try_acquire_symbol_lock("SOL", "other", "busy"));
        assert!(!reg.try_acquire_two_symbol_locks("ETH", "SOL", "t1", "rotation"));
        // ETH must have been released again, not left dangling.
        assert!(!reg.is_symbol_locked("ETH"));
    }

    #[test]
    fn register_then_force_clear_restores_empty_slot() {
        let reg = ExecutionLockRegistry::new();
        reg.register_order_placing("ETH", Venue::Hl, PositionSide::Long, "t1", 1.0, 100.0);
        assert!(reg.has_active_order(Venue::Hl, "ETH", PositionSide::Long));
        reg.force_clear_order(Venue::Hl, "ETH", PositionSide::Long);
        assert!(!reg.has_active_order(Venue::Hl, "ETH", PositionSide::Long));
    }

    #[test]
    fn terminal_status_moves_order_to_history() {
        let reg = ExecutionLockRegistry::new();
        reg.register_order_placing("ETH", Venue::Hl, PositionSide::Long, "t1", 1.0, 100.0);
        reg.update_order_status(
            Venue::Hl,
            "ETH",
            PositionSide::Long,
            OrderStatus::Filled,
            Some("abc"),
            None,
            None,
        );
        assert!(!reg.has_active_order(Venue::Hl, "ETH", PositionSide::Long));
        assert_eq!(reg.order_history_len(), 1);
    }

    #[test]
    fn execution_cooldown_window() {
        let reg = ExecutionLockRegistry::new();
        reg.try_acquire_symbol_lock("ETH", "t1", "open");
        reg.release_symbol_lock("ETH", "t1");
        assert!(reg.is_in_execution_cooldown("ETH", Duration::from_secs(60)));
        assert!(!reg.is_in_execution_cooldown("ETH", Duration::from_secs(0)));
    }
}
