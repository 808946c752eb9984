//! Performance Logger: a durable ledger of realized funding capture and
//! trading costs, derived from HedgedPair lifecycle events and fill
//! reports. Consumed by the Evaluator for break-even estimates and exposed
//! read-only via diagnostics.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::error::CoreResult;

#[derive(Debug, Clone, Default)]
pub struct SymbolPerformance {
    pub symbol: String,
    pub realized_funding_usd: f64,
    pub trading_costs_usd: f64,
    pub realized_apy_percent: f64,
}

#[derive(Clone)]
pub struct PerformanceLogger {
    conn: Arc<Mutex<Connection>>,
}

impl PerformanceLogger {
    pub fn open(db_path: &str) -> CoreResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS funding_capture (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                pair_id TEXT NOT NULL,
                funding_usd REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_funding_capture_symbol ON funding_capture(symbol, ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trading_costs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                pair_id TEXT NOT NULL,
                fees_usd REAL NOT NULL,
                slippage_usd REAL NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trading_costs_symbol ON trading_costs(symbol, ts DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn record_funding_capture(&self, symbol: &str, pair_id: &str, funding_usd: f64) -> CoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO funding_capture (ts, symbol, pair_id, funding_usd) VALUES (?1, ?2, ?3, ?4)",
            params![chrono::Utc::now().timestamp(), symbol, pair_id, funding_usd],
        )?;
        Ok(())
    }

    pub async fn record_trading_cost(&self, symbol: &str, pair_id: &str, fees_usd: f64, slippage_usd: f64) -> CoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trading_costs (ts, symbol, pair_id, fees_usd, slippage_usd) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chrono::Utc::now().timestamp(), symbol, pair_id, fees_usd, slippage_usd],
        )?;
        Ok(())
    }

    /// Aggregates funding capture and costs for a single symbol over the
    /// full retained history, plus a realized-APY estimate that annualizes
    /// (funding − costs) against the symbol's notional over the lookback.
    pub async fn symbol_performance(&self, symbol: &str, notional_usd: f64) -> CoreResult<SymbolPerformance> {
        let conn = self.conn.lock().await;
        let realized_funding_usd: f64 = conn.query_row(
            "SELECT COALESCE(SUM(funding_usd), 0.0) FROM funding_capture WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        let trading_costs_usd: f64 = conn.query_row(
            "SELECT COALESCE(SUM(fees_usd + slippage_usd), 0.0) FROM trading_costs WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        let earliest_ts: Option<i64> = conn
            .query_row(
                "SELECT MIN(ts) FROM funding_capture WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .ok()
            .flatten();

        let realized_apy_percent = match earliest_ts {
            Some(ts) if notional_usd > 0.0 => {
                let elapsed_days = ((chrono::Utc::now().timestamp() - ts) as f64 / 86_400.0).max(1.0 / 24.0);
                let net = realized_funding_usd - trading_costs_usd;
                (net / notional_usd) * (365.0 / elapsed_days) * 100.0
            }
            _ => 0.0,
        };

        Ok(SymbolPerformance {
            symbol: symbol.to_string(),
            realized_funding_usd,
            trading_costs_usd,
            realized_apy_percent,
        })
    }

    pub async fn aggregate_performance(&self, symbols: &[String], notional_usd: f64) -> CoreResult<HashMap<String, SymbolPerformance>> {
        let mut out = HashMap::new();
        for symbol in symbols {
            out.insert(symbol.clone(), self.symbol_performance(symbol, notional_usd).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_aggregates_funding_and_costs() {
        let dir = tempfile::tempdir().unwrap();
        let logger = PerformanceLogger::open(dir.path().join("perf.db").to_str().unwrap()).unwrap();

        logger.record_funding_capture("ETH", "pair-1", 15.0).await.unwrap();
        logger.record_trading_cost("ETH", "pair-1", 2.0, 0.5).await.unwrap();

        let perf = logger.symbol_performance("ETH", 1000.0).await.unwrap();
        assert!((perf.realized_funding_usd - 15.0).abs() < 1e-9);
        assert!((perf.trading_costs_usd - 2.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unknown_symbol_returns_zeroed_performance() {
        let dir = tempfile::tempdir().unwrap();
        let logger = PerformanceLogger::open(dir.path().join("perf.db").to_str().unwrap()).unwrap();
        let perf = logger.symbol_performance("DOESNOTEXIST", 1000.0).await.unwrap();
        assert_eq!(perf.realized_funding_usd, 0.0);
        assert_eq!(perf.realized_apy_percent, 0.0);
    }
}
