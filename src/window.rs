//! Window resolution: a named period or explicit range -> a concrete
//! [start, end) UTC instant pair anchored to "now".
//!
//! Named periods are rolling trailing windows ("day" = the 24 hours ending
//! now), not calendar-aligned ones. "month" and "year" step back by calendar
//! months so the window edge lands on the same day-of-month where possible.

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Months, Utc};
use std::str::FromStr;

use crate::store::Datastore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
    Year,
    Lifetime,
    Custom {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl Period {
    /// Tag stored on snapshot rows for this period.
    pub fn range_type(&self) -> &'static str {
        match self {
            Period::Day => "day",
            Period::Week => "week",
            Period::Month => "month",
            Period::Year => "year",
            Period::Lifetime => "lifetime",
            Period::Custom { .. } => "custom",
        }
    }

    /// The four rolling named periods the scheduled bulk refresh covers.
    pub const ROLLING: [Period; 4] = [Period::Day, Period::Week, Period::Month, Period::Year];
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "day" => Ok(Period::Day),
            "week" => Ok(Period::Week),
            "month" => Ok(Period::Month),
            "year" => Ok(Period::Year),
            "lifetime" => Ok(Period::Lifetime),
            other => bail!("invalid period type: {}", other),
        }
    }
}

/// Resolve `period` to a concrete [start, end) pair. Returns None when a
/// lifetime window has no events to span; the caller must skip snapshot
/// creation instead of writing a degenerate row.
pub async fn resolve<S: Datastore>(
    store: &S,
    user_id: i64,
    period: &Period,
    now: DateTime<Utc>,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let window = match period {
        Period::Day => Some((now - Duration::days(1), now)),
        Period::Week => Some((now - Duration::days(7), now)),
        Period::Month => Some((now - Months::new(1), now)),
        Period::Year => Some((now - Months::new(12), now)),
        Period::Lifetime => store.play_bounds(user_id).await?,
        Period::Custom { start, end } => Some((*start, *end)),
    };
    Ok(window)
}
