//! Named lock data types

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use idemlock_persistence::{LeaseState, LockRecord, lease_state};

/// A lease on a named lock, held by whoever received it from `acquire`.
///
/// `version` is the fencing token: release and renewal only succeed while the
/// row still carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub name: String,
    pub version: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub(crate) fn from_record(record: LockRecord, acquired_at: DateTime<Utc>) -> Self {
        Self {
            name: record.name,
            version: record.version,
            acquired_at,
            expires_at: record.expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.remaining(now).is_none()
    }

    /// Time left on the lease, `None` once it has run out.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match lease_state(Some(self.expires_at), now) {
            LeaseState::Held { remaining } => Some(remaining),
            _ => None,
        }
    }
}

/// Outcome of releasing a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ReleaseOutcome {
    Released,
    /// The version had already moved on: the lease expired and was reclaimed
    /// by another holder. Nothing was changed.
    Stale,
}

impl ReleaseOutcome {
    pub fn is_released(&self) -> bool {
        matches!(self, ReleaseOutcome::Released)
    }
}

/// Lock service statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Successful acquisitions, including reclaims
    pub total_acquisitions: u64,
    /// Acquisitions that took over an expired lease
    pub total_reclaims: u64,
    /// Acquire calls that gave up with `LockUnavailable`
    pub failed_acquisitions: u64,
    pub total_releases: u64,
    pub stale_releases: u64,
    pub total_renewals: u64,
}

#[derive(Debug, Default)]
pub(crate) struct LockStatsCollector {
    total_acquisitions: AtomicU64,
    total_reclaims: AtomicU64,
    failed_acquisitions: AtomicU64,
    total_releases: AtomicU64,
    stale_releases: AtomicU64,
    total_renewals: AtomicU64,
}

impl LockStatsCollector {
    pub(crate) fn acquired(&self, reclaimed: bool) {
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        if reclaimed {
            self.total_reclaims.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn acquire_failed(&self) {
        self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn released(&self, outcome: ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Released => self.total_releases.fetch_add(1, Ordering::Relaxed),
            ReleaseOutcome::Stale => self.stale_releases.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn renewed(&self) {
        self.total_renewals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
            total_reclaims: self.total_reclaims.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
            total_releases: self.total_releases.load(Ordering::Relaxed),
            stale_releases: self.stale_releases.load(Ordering::Relaxed),
            total_renewals: self.total_renewals.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_lock_remaining() {
        let now = Utc::now();
        let lock = Lock {
            name: "smoke".to_string(),
            version: 1,
            acquired_at: now,
            expires_at: now + TimeDelta::seconds(10),
        };

        assert_eq!(lock.remaining(now), Some(Duration::from_secs(10)));
        assert!(!lock.is_expired(now));
        assert!(lock.is_expired(now + TimeDelta::seconds(10)));
    }

    #[test]
    fn test_stats_collector() {
        let stats = LockStatsCollector::default();
        stats.acquired(false);
        stats.acquired(true);
        stats.acquire_failed();
        stats.released(ReleaseOutcome::Released);
        stats.released(ReleaseOutcome::Stale);
        stats.renewed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_acquisitions, 2);
        assert_eq!(snapshot.total_reclaims, 1);
        assert_eq!(snapshot.failed_acquisitions, 1);
        assert_eq!(snapshot.total_releases, 1);
        assert_eq!(snapshot.stale_releases, 1);
        assert_eq!(snapshot.total_renewals, 1);
    }
}
