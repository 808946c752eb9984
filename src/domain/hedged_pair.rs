use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Venue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PairStatus {
    Pending,
    Complete,
    SingleLeg,
    Closed,
}

/// The durable record of intent for one opened hedged pair. This is the
/// source of truth single-leg recovery consults to recover the *original*
/// (long-venue, short-venue) pairing — funding rates drift, intent does not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgedPair {
    pub pair_id: String,
    pub symbol: String,
    pub long_venue: Venue,
    pub short_venue: Venue,
    pub intended_size: f64,
    pub long_filled: bool,
    pub short_filled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: PairStatus,
    pub retry_count: u32,

    /// The expected return the evaluator computed at entry, as a percent of
    /// notional per hour. Profit-take uses this × hours-held as the
    /// `expectedFunding%` side of its close-fraction ratio — a quantity
    /// distinct from the realized PnL, not derived from it.
    pub expected_return_percent_per_hour: f64,
}

impl HedgedPair {
    /// pair-id = symbol + long-venue + short-venue + monotonic millisecond
    /// timestamp — unique under 1ms resolution, stable to read back.
    pub fn new_id(symbol: &str, long_venue: Venue, short_venue: Venue) -> String {
        format!(
            "{}-{}-{}-{}",
            symbol,
            long_venue.as_str(),
            short_venue.as_str(),
            Utc::now().timestamp_millis()
        )
    }

    pub fn new(symbol: String, long_venue: Venue, short_venue: Venue, intended_size: f64) -> Self {
        Self::new_with_expected_return(symbol, long_venue, short_venue, intended_size, 0.0)
    }

    pub fn new_with_expected_return(
        symbol: String,
        long_venue: Venue,
        short_venue: Venue,
        intended_size: f64,
        expected_return_percent_per_hour: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            pair_id: Self::new_id(&symbol, long_venue, short_venue),
            symbol,
            long_venue,
            short_venue,
            intended_size,
            long_filled: false,
            short_filled: false,
            created_at: now,
            updated_at: now,
            status: PairStatus::Pending,
            retry_count: 0,
            expected_return_percent_per_hour,
        }
    }

    /// Hours elapsed since this pair was created, used to scale the entry
    /// expected-return rate into a holding-period expected-funding percent.
    pub fn hours_held(&self) -> f64 {
        (Utc::now() - self.created_at).num_milliseconds() as f64 / 3_600_000.0
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.status, PairStatus::Closed)
    }

    /// The venue the caller does *not* already hold the leg on, given which
    /// side of the pair currently exists. Returns None if neither leg's
    /// identity matches (should not happen for a pair produced by `new`).
    pub fn missing_venue_for(&self, existing_venue: Venue) -> Option<Venue> {
        if existing_venue == self.long_venue {
            Some(self.short_venue)
        } else if existing_venue == self.short_venue {
            Some(self.long_venue)
        } else {
            None
        }
    }
}
