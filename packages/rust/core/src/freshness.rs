//! Pure freshness checks for corridor research.
//!
//! Reads never trigger state transitions; only the orchestrator moves a
//! corridor through `stale → refreshing → fresh | error`, and it does so
//! through the storage layer's compare-and-set operations. These helpers
//! let any caller answer "is this stale?" without side effects.

use chrono::{DateTime, Duration, Utc};

/// Default staleness threshold, in days.
pub const FRESHNESS_THRESHOLD_DAYS: u32 = 30;

/// Whether research completed at `last_researched_at` is still fresh at
/// `now`. A corridor that has never been researched is never fresh.
pub fn is_fresh(
    last_researched_at: Option<DateTime<Utc>>,
    threshold_days: u32,
    now: DateTime<Utc>,
) -> bool {
    match last_researched_at {
        Some(at) => now - at < Duration::days(threshold_days as i64),
        None => false,
    }
}

/// Inverse of [`is_fresh`].
pub fn is_stale(
    last_researched_at: Option<DateTime<Utc>>,
    threshold_days: u32,
    now: DateTime<Utc>,
) -> bool {
    !is_fresh(last_researched_at, threshold_days, now)
}

/// Human-readable age of the last research pass.
pub fn research_age(last_researched_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = last_researched_at else {
        return "never".into();
    };

    let days = (now - at).num_days();
    match days {
        i64::MIN..=0 => "today".into(),
        1 => "1 day ago".into(),
        2..=6 => format!("{days} days ago"),
        7..=29 => format!("{} weeks ago", days / 7),
        _ => format!("{} months ago", days / 30),
    }
}
