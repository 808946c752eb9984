//! Application configuration, loaded once at startup from the environment
//! (with `.env` support). Invalid values fail startup loudly rather than
//! silently substituting a default.

use std::time::Duration;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit symbol list; empty means auto-discover (left to the venue
    /// metadata collaborator, out of scope here).
    pub keeper_symbols: Vec<String>,
    pub blacklisted_symbols: Vec<String>,
    pub min_spread: f64,
    pub max_position_size_usd: f64,
    pub leverage: f64,
    pub perp_spot_enabled: bool,

    pub fill_check_min_age: Duration,
    pub fill_check_aggressive_age: Duration,
    pub fill_check_market_age: Duration,
    pub stale_order_age: Duration,
    pub zombie_timeout: Duration,
    pub pending_grace: Duration,
    pub execution_cooldown: Duration,

    pub nuclear_imbalance_percent: f64,
    pub nuclear_timeout: Duration,
    pub nuclear_max_attempts: u32,

    pub profit_take_min_usd: f64,
    pub profit_take_min_close_percent: f64,
    pub profit_take_max_reversion_hours: f64,
    pub profit_take_cooldown_hours: f64,

    pub rotation_min_hours_saved: f64,

    pub circuit_breaker_error_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub circuit_breaker_half_open_attempts: u32,

    pub max_retries_executor: u32,
    pub max_retries_single_leg: u32,
    pub max_backoff_delay_opening: Duration,

    pub position_state_dir: String,
    pub http_port: u16,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> CoreResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| CoreError::Config(format!("{key}: invalid value {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn csv_env(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .split(',')
            .map(|s| crate::domain::normalize_symbol(s.trim()))
            .filter(|s| !s.is_empty())
            .collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

impl Config {
    pub fn from_env() -> CoreResult<Self> {
        let _ = dotenv::dotenv();

        let config = Self {
            keeper_symbols: csv_env("KEEPER_SYMBOLS", &[]),
            blacklisted_symbols: csv_env("KEEPER_BLACKLISTED_SYMBOLS", &["NVDA"]),
            min_spread: env_or("KEEPER_MIN_SPREAD", 0.0001)?,
            max_position_size_usd: env_or("KEEPER_MAX_POSITION_SIZE_USD", 10_000.0)?,
            leverage: env_or("KEEPER_LEVERAGE", 2.0)?,
            perp_spot_enabled: env_or("PERP_SPOT_ENABLED", true)?,

            fill_check_min_age: Duration::from_secs(env_or("FILL_CHECK_MIN_AGE_SECONDS", 45)?),
            fill_check_aggressive_age: Duration::from_secs(env_or(
                "FILL_CHECK_AGGRESSIVE_AGE_SECONDS",
                90,
            )?),
            fill_check_market_age: Duration::from_secs(env_or(
                "FILL_CHECK_MARKET_AGE_SECONDS",
                120,
            )?),
            stale_order_age: Duration::from_secs(60 * env_or::<u64>("STALE_ORDER_AGE_MINUTES", 2)?),
            zombie_timeout: Duration::from_secs(env_or("ZOMBIE_TIMEOUT_SECONDS", 300)?),
            pending_grace: Duration::from_secs(
                60 * env_or::<u64>("PENDING_GRACE_MINUTES", 5)?,
            ),
            execution_cooldown: Duration::from_secs(env_or("EXECUTION_COOLDOWN_SECONDS", 60)?),

            nuclear_imbalance_percent: env_or("NUCLEAR_IMBALANCE_PERCENT", 30.0)?,
            nuclear_timeout: Duration::from_secs(
                60 * env_or::<u64>("NUCLEAR_TIMEOUT_MINUTES", 10)?,
            ),
            nuclear_max_attempts: env_or("NUCLEAR_MAX_ATTEMPTS", 3)?,

            profit_take_min_usd: env_or("PROFIT_TAKE_MIN_USD", 10.0)?,
            profit_take_min_close_percent: env_or("PROFIT_TAKE_MIN_CLOSE_PERCENT", 0.25)?,
            profit_take_max_reversion_hours: env_or("PROFIT_TAKE_MAX_REVERSION_HOURS", 168.0)?,
            profit_take_cooldown_hours: env_or("PROFIT_TAKE_COOLDOWN_HOURS", 1.0)?,

            rotation_min_hours_saved: env_or("ROTATION_MIN_HOURS_SAVED", 2.0)?,

            circuit_breaker_error_threshold: env_or("CIRCUIT_BREAKER_ERROR_THRESHOLD", 10)?,
            circuit_breaker_cooldown: Duration::from_millis(env_or(
                "CIRCUIT_BREAKER_COOLDOWN_MS",
                300_000,
            )?),
            circuit_breaker_half_open_attempts: env_or(
                "CIRCUIT_BREAKER_HALF_OPEN_ATTEMPTS",
                3,
            )?,

            max_retries_executor: env_or("EXECUTOR_MAX_RETRIES", 15)?,
            max_retries_single_leg: env_or("SINGLE_LEG_MAX_RETRIES", 5)?,
            max_backoff_delay_opening: Duration::from_secs(env_or(
                "MAX_BACKOFF_DELAY_OPENING_SECONDS",
                30,
            )?),

            position_state_dir: std::env::var("POSITION_STATE_DIR")
                .unwrap_or_else(|_| "./data".to_string()),
            http_port: env_or("PORT", 8080)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.min_spread < 0.0 {
            return Err(CoreError::Config("KEEPER_MIN_SPREAD must be >= 0".into()));
        }
        if self.max_position_size_usd <= 0.0 {
            return Err(CoreError::Config(
                "KEEPER_MAX_POSITION_SIZE_USD must be > 0".into(),
            ));
        }
        if self.leverage <= 0.0 {
            return Err(CoreError::Config("KEEPER_LEVERAGE must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.profit_take_min_close_percent) {
            return Err(CoreError::Config(
                "PROFIT_TAKE_MIN_CLOSE_PERCENT must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn is_blacklisted(&self, normalized_symbol: &str) -> bool {
        self.blacklisted_symbols.iter().any(|b| b == normalized_symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        // Safety net for test isolation: ensure no leaked env var breaks this.
        std::env::remove_var("KEEPER_MIN_SPREAD");
        std::env::remove_var("KEEPER_MAX_POSITION_SIZE_USD");
        std::env::remove_var("KEEPER_LEVERAGE");
        let cfg = Config::from_env().expect("defaults should validate");
        assert_eq!(cfg.blacklisted_symbols, vec!["NVDA".to_string()]);
        assert_eq!(cfg.nuclear_max_attempts, 3);
    }
}
