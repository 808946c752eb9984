//! Position-State Store: the durable record of every intended hedged pair.
//! Backed by a single JSON file at `POSITION_STATE_DIR/positions.json`,
//! written atomically (write-to-temp then rename) so a crash mid-save never
//! corrupts the store.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{HedgedPair, PairStatus, Venue};
use crate::error::CoreResult;

pub struct PositionStateStore {
    path: PathBuf,
    state: Mutex<Vec<HedgedPair>>,
}

impl PositionStateStore {
    /// Loads `dir/positions.json` if present, else starts empty. `dir` is
    /// created if missing.
    pub async fn open(dir: &str) -> CoreResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = Path::new(dir).join("positions.json");
        let pairs = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Vec::new()
        };
        info!(path = %path.display(), count = pairs.len(), "loaded position state");
        Ok(Self {
            path,
            state: Mutex::new(pairs),
        })
    }

    async fn flush(&self, pairs: &[HedgedPair]) -> CoreResult<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let serialized = serde_json::to_string_pretty(pairs)?;
        tokio::fs::write(&tmp_path, serialized).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn save(&self, pair: HedgedPair) -> CoreResult<()> {
        let mut pairs = self.state.lock().await;
        pairs.push(pair);
        self.flush(&pairs).await
    }

    /// Applies `mutate` to the stored record matching `pair_id`, bumping
    /// `updated_at`, then persists. No-op if the id is unknown.
    pub async fn update<F: FnOnce(&mut HedgedPair)>(&self, pair_id: &str, mutate: F) -> CoreResult<()> {
        let mut pairs = self.state.lock().await;
        if let Some(pair) = pairs.iter_mut().find(|p| p.pair_id == pair_id) {
            mutate(pair);
            pair.updated_at = Utc::now();
        } else {
            warn!(pair_id, "update() called for unknown pair id");
            return Ok(());
        }
        self.flush(&pairs).await
    }

    pub async fn get(&self, pair_id: &str) -> Option<HedgedPair> {
        self.state
            .lock()
            .await
            .iter()
            .find(|p| p.pair_id == pair_id)
            .cloned()
    }

    pub async fn get_all(&self) -> Vec<HedgedPair> {
        self.state.lock().await.clone()
    }

    pub async fn get_by_status(&self, status: PairStatus) -> Vec<HedgedPair> {
        self.state
            .lock()
            .await
            .iter()
            .filter(|p| p.status == status)
            .cloned()
            .collect()
    }

    pub async fn get_active(&self) -> Vec<HedgedPair> {
        self.state
            .lock()
            .await
            .iter()
            .filter(|p| p.is_active())
            .cloned()
            .collect()
    }

    /// Looks up the most-recently-created active pair for a normalized
    /// symbol — used by single-leg recovery to recover original intent.
    pub async fn get_active_for_symbol(&self, symbol: &str) -> Option<HedgedPair> {
        self.state
            .lock()
            .await
            .iter()
            .filter(|p| p.symbol == symbol && p.is_active())
            .max_by_key(|p| p.created_at)
            .cloned()
    }

    pub async fn mark_complete(&self, pair_id: &str) -> CoreResult<()> {
        self.update(pair_id, |p| {
            p.status = PairStatus::Complete;
            p.long_filled = true;
            p.short_filled = true;
        })
        .await
    }

    pub async fn mark_single_leg(&self, pair_id: &str, long_filled: bool, short_filled: bool) -> CoreResult<()> {
        self.update(pair_id, |p| {
            p.status = PairStatus::SingleLeg;
            p.long_filled = long_filled;
            p.short_filled = short_filled;
        })
        .await
    }

    pub async fn mark_closed(&self, pair_id: &str) -> CoreResult<()> {
        self.update(pair_id, |p| {
            p.status = PairStatus::Closed;
            p.long_filled = false;
            p.short_filled = false;
        })
        .await
    }

    pub async fn increment_retry_count(&self, pair_id: &str) -> CoreResult<u32> {
        let mut pairs = self.state.lock().await;
        let count = if let Some(pair) = pairs.iter_mut().find(|p| p.pair_id == pair_id) {
            pair.retry_count += 1;
            pair.updated_at = Utc::now();
            pair.retry_count
        } else {
            0
        };
        self.flush(&pairs).await?;
        Ok(count)
    }

    pub async fn delete(&self, pair_id: &str) -> CoreResult<()> {
        let mut pairs = self.state.lock().await;
        pairs.retain(|p| p.pair_id != pair_id);
        self.flush(&pairs).await
    }

    /// Removes CLOSED records older than `days` — run once at startup after
    /// replaying the store against venue truth.
    pub async fn cleanup_old_positions(&self, days: i64) -> CoreResult<usize> {
        let mut pairs = self.state.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let before = pairs.len();
        pairs.retain(|p| !(p.status == PairStatus::Closed && p.updated_at < cutoff));
        let removed = before - pairs.len();
        if removed > 0 {
            self.flush(&pairs).await?;
        }
        Ok(removed)
    }
}

/// Helper kept next to the store (not exported) so tests can build a pair
/// without repeating venue boilerplate.
#[cfg(test)]
pub(crate) fn test_pair(symbol: &str, long: Venue, short: Venue) -> HedgedPair {
    HedgedPair::new(symbol.to_string(), long, short, 1.0)
}
