//! Persisted row shapes
//!
//! Both tables are addressed by a runtime table name, so rows are decoded with
//! `FromQueryResult` from hand-built statements instead of static entities.

use chrono::{DateTime, SubsecRound, Utc};
use sea_orm::{DeriveIden, FromQueryResult};

/// Columns of the idempotency table.
#[derive(DeriveIden, Clone, Copy, Debug)]
pub enum RecordColumn {
    Id,
    Result,
    CreatedAt,
    UpdatedAt,
    Version,
    LockedUntil,
}

impl RecordColumn {
    pub const ALL: [RecordColumn; 6] = [
        RecordColumn::Id,
        RecordColumn::Result,
        RecordColumn::CreatedAt,
        RecordColumn::UpdatedAt,
        RecordColumn::Version,
        RecordColumn::LockedUntil,
    ];
}

/// Columns of the lock table.
#[derive(DeriveIden, Clone, Copy, Debug)]
pub enum LockColumn {
    Name,
    Version,
    ExpiresAt,
}

impl LockColumn {
    pub const ALL: [LockColumn; 3] = [LockColumn::Name, LockColumn::Version, LockColumn::ExpiresAt];
}

/// One idempotency record.
///
/// `version` and `locked_until` only carry meaning for the standalone
/// coordinator; embedded mode leaves `version` at its column default and never
/// writes `locked_until`.
#[derive(Clone, Debug, PartialEq, Eq, FromQueryResult)]
pub struct IdempotencyRecord {
    /// The idempotency key
    pub id: String,
    /// Present once the protected operation has completed
    pub result: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// CAS token, starts at 1
    pub version: i64,
    /// Lease expiry while the record is held
    pub locked_until: Option<DateTime<Utc>>,
}

/// Where a record stands relative to its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// A result is stored; the record never changes again.
    Completed,
    /// An owner is working on it and the lease still runs for `remaining`.
    Held { remaining: std::time::Duration },
    /// Released or expired: the next caller may claim it.
    Reclaimable,
}

impl IdempotencyRecord {
    /// A fresh record as inserted by the first writer.
    pub fn pending(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            result: None,
            created_at: now,
            updated_at: now,
            version: 1,
            locked_until: None,
        }
    }

    pub fn with_lease(mut self, locked_until: DateTime<Utc>) -> Self {
        self.locked_until = Some(locked_until);
        self
    }

    pub fn is_completed(&self) -> bool {
        self.result.is_some()
    }

    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.locked_until
    }

    pub fn lease_state(&self, now: DateTime<Utc>) -> LeaseState {
        if self.is_completed() {
            return LeaseState::Completed;
        }
        lease_state(self.locked_until, now)
    }
}

/// One named lock row.
#[derive(Clone, Debug, PartialEq, Eq, FromQueryResult)]
pub struct LockRecord {
    pub name: String,
    pub version: i64,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(lease_state(Some(self.expires_at), now), LeaseState::Reclaimable)
    }
}

/// Lease classification shared by both tables. A missing expiry counts as
/// reclaimable.
pub fn lease_state(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> LeaseState {
    match expires_at {
        Some(expires_at) if expires_at > now => LeaseState::Held {
            remaining: (expires_at - now).to_std().unwrap_or_default(),
        },
        _ => LeaseState::Reclaimable,
    }
}

/// Current time truncated to the microsecond precision the supported engines store.
pub fn db_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
