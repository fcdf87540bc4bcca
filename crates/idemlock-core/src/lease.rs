//! Lease mechanics shared by the lock service and the standalone coordinator
//!
//! A lease is an expiry timestamp on a versioned row. Whoever wins the insert
//! holds it; after expiry any caller may claim it with a compare-and-swap on
//! the version it read, so at most one reclaimer wins.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Result of one read-then-claim round against an existing row.
#[derive(Debug)]
pub(crate) enum Claim<T> {
    /// The CAS went through; the caller owns the lease now.
    Won(T),
    /// Still held by someone else for `remaining`.
    Busy { remaining: Duration },
    /// The row was reclaimable but a concurrent claimer moved the version first.
    Lost,
}

/// 9999-12-31T23:59:59Z, the largest instant a MySQL `DATETIME` holds.
const LATEST_EXPIRY_SECS: i64 = 253_402_300_799;

/// Latest expiry ever written to a lease column.
pub(crate) fn latest_expiry() -> DateTime<Utc> {
    DateTime::from_timestamp(LATEST_EXPIRY_SECS, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Expiry of a lease granted at `now`. Saturates at [`latest_expiry`]
/// instead of overflowing.
pub(crate) fn expiry_after(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let latest = latest_expiry();
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .map_or(latest, |expiry| expiry.min(latest))
}

/// Exponential backoff between polls, capped at `max`.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}
