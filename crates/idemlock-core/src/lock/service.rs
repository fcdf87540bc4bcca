// Named lock service
// Leases are rows keyed by name; ownership moves only through versioned CAS

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use idemlock_common::config::{LockConfig, require_lease, require_name};
use idemlock_common::{IdemError, Result};
use idemlock_persistence::repository;
use idemlock_persistence::sea_orm::DatabaseConnection;
use idemlock_persistence::{
    InsertConflict, LOCK_COLUMNS, LeaseState, LockRecord, REQUIRED_ISOLATION,
    classify_insert_error, db_now, lease_state, run_in_transaction, verify_table,
};
use tokio::time::Instant;
use tracing::{Instrument, Span};

use super::model::{Lock, LockStats, LockStatsCollector, ReleaseOutcome};
use crate::lease::{Backoff, Claim, expiry_after};

/// Named lock service
///
/// Every operation takes the caller's span; events emitted while it runs are
/// recorded inside that span.
#[async_trait]
pub trait NamedLockService: Send + Sync {
    /// Acquire `name` for the configured lock duration.
    async fn acquire(&self, log: &Span, name: &str) -> Result<Lock>;

    /// Acquire `name` for `lease`, retrying a held lock until the configured
    /// attempts or the attempt timeout run out.
    async fn acquire_for(&self, log: &Span, name: &str, lease: Duration) -> Result<Lock>;

    /// Release a lock. A lease that was already reclaimed by someone else is
    /// reported as `Stale` and left alone.
    async fn release(&self, log: &Span, lock: &Lock) -> Result<ReleaseOutcome>;

    /// Extend a held lease. Fails with `LeaseLost` once the version moved.
    async fn renew(&self, log: &Span, lock: &Lock, lease: Duration) -> Result<Lock>;

    /// Current row for `name`, if any.
    async fn get(&self, name: &str) -> Result<Option<LockRecord>>;

    fn stats(&self) -> LockStats;
}

/// Lock service backed by a lock table
#[derive(Clone)]
pub struct DbLockService {
    db: DatabaseConnection,
    config: LockConfig,
    stats: Arc<LockStatsCollector>,
}

impl DbLockService {
    /// Validates `config` before anything touches the store.
    pub fn new(db: DatabaseConnection, config: LockConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            table = %config.table_name,
            lock_duration_ms = config.lock_duration.as_millis() as u64,
            max_attempts = config.max_attempts,
            "Lock service created"
        );
        Ok(Self {
            db,
            config,
            stats: Arc::new(LockStatsCollector::default()),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Check that the lock table exists with the expected columns.
    pub async fn verify_schema(&self) -> Result<()> {
        verify_table(&self.db, &self.config.table_name, &LOCK_COLUMNS).await
    }

    /// One attempt: insert, or take over an expired row. `None` when the lock
    /// is held by someone else.
    async fn try_acquire(&self, name: &str, lease: Duration, deadline: Instant) -> Result<Option<Lock>> {
        let table = self.config.table_name.clone();
        let now = db_now();
        let record = LockRecord {
            name: name.to_string(),
            version: 1,
            expires_at: expiry_after(now, lease),
        };

        let inserted = {
            let (table, record) = (table.clone(), record.clone());
            run_in_transaction(&self.db, REQUIRED_ISOLATION, move |txn| {
                Box::pin(async move {
                    repository::lock::insert(txn, &table, &record).await?;
                    Ok(())
                })
            })
            .await
        };

        match inserted {
            Ok(()) => {
                tracing::debug!(lock = name, "Lock row inserted");
                self.stats.acquired(false);
                return Ok(Some(Lock::from_record(record, now)));
            }
            Err(err) => {
                if let InsertConflict::Fatal(err) = classify_insert_error(err, &table) {
                    return Err(err);
                }
            }
        }

        loop {
            match self.claim_expired(name, lease).await? {
                Claim::Won(lock) => {
                    tracing::debug!(lock = name, version = lock.version, "Expired lock reclaimed");
                    self.stats.acquired(true);
                    return Ok(Some(lock));
                }
                Claim::Busy { remaining } => {
                    tracing::debug!(
                        lock = name,
                        remaining_ms = remaining.as_millis() as u64,
                        "Lock held by another owner"
                    );
                    return Ok(None);
                }
                Claim::Lost => {
                    tracing::debug!(lock = name, "Lost reclaim race, re-reading");
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn claim_expired(&self, name: &str, lease: Duration) -> Result<Claim<Lock>> {
        let table = self.config.table_name.clone();
        let name = name.to_string();
        run_in_transaction(&self.db, REQUIRED_ISOLATION, move |txn| {
            Box::pin(async move {
                let now = db_now();
                let Some(current) = repository::lock::find(txn, &table, &name).await? else {
                    tracing::warn!(lock = %name, "Lock row vanished after conflict");
                    return Err(IdemError::RecordVanished { key: name });
                };
                if let LeaseState::Held { remaining } = lease_state(Some(current.expires_at), now) {
                    return Ok(Claim::Busy { remaining });
                }

                let expires_at = expiry_after(now, lease);
                let affected =
                    repository::lock::compare_and_set(txn, &table, &name, current.version, expires_at)
                        .await?;
                match affected {
                    0 => Ok(Claim::Lost),
                    1 => Ok(Claim::Won(Lock {
                        name,
                        version: current.version + 1,
                        acquired_at: now,
                        expires_at,
                    })),
                    actual => Err(IdemError::RowCountMismatch {
                        key: name,
                        expected: 1,
                        actual,
                    }),
                }
            })
        })
        .await
    }

    /// CAS `lock` to a new expiry. Returns rows affected.
    async fn move_expiry(&self, lock: &Lock, expires_at: chrono::DateTime<chrono::Utc>) -> Result<u64> {
        let table = self.config.table_name.clone();
        let name = lock.name.clone();
        let version = lock.version;
        run_in_transaction(&self.db, REQUIRED_ISOLATION, move |txn| {
            Box::pin(async move {
                let affected =
                    repository::lock::compare_and_set(txn, &table, &name, version, expires_at).await?;
                Ok(affected)
            })
        })
        .await
    }
}

#[async_trait]
impl NamedLockService for DbLockService {
    async fn acquire(&self, log: &Span, name: &str) -> Result<Lock> {
        self.acquire_for(log, name, self.config.lock_duration).await
    }

    async fn acquire_for(&self, log: &Span, name: &str, lease: Duration) -> Result<Lock> {
        async move {
            require_name("lock name", name)?;
            require_lease(lease)?;

            let deadline = Instant::now() + self.config.attempt_timeout;
            let mut backoff = Backoff::new(self.config.retry_backoff, self.config.attempt_timeout);
            let mut attempts = 0;

            while attempts < self.config.max_attempts {
                attempts += 1;
                if let Some(lock) = self.try_acquire(name, lease, deadline).await? {
                    metrics::counter!("idemlock_lock_acquired_total").increment(1);
                    tracing::info!(lock = name, version = lock.version, attempts, "Lock acquired");
                    return Ok(lock);
                }

                metrics::counter!("idemlock_lock_contended_total").increment(1);
                let now = Instant::now();
                if attempts == self.config.max_attempts || now >= deadline {
                    break;
                }
                tokio::time::sleep(backoff.next_delay().min(deadline - now)).await;
            }

            self.stats.acquire_failed();
            tracing::warn!(lock = name, attempts, "Lock unavailable");
            Err(IdemError::LockUnavailable {
                name: name.to_string(),
                attempts,
            })
        }
        .instrument(log.clone())
        .await
    }

    async fn release(&self, log: &Span, lock: &Lock) -> Result<ReleaseOutcome> {
        async move {
            // Expire rather than delete: the row stays for the next acquirer's CAS.
            let outcome = match self.move_expiry(lock, db_now()).await? {
                1 => ReleaseOutcome::Released,
                0 => ReleaseOutcome::Stale,
                actual => {
                    tracing::error!(lock = %lock.name, actual, "Lock release touched more than one row");
                    return Err(IdemError::RowCountMismatch {
                        key: lock.name.clone(),
                        expected: 1,
                        actual,
                    });
                }
            };

            self.stats.released(outcome);
            match outcome {
                ReleaseOutcome::Released => {
                    metrics::counter!("idemlock_lock_released_total").increment(1);
                    tracing::info!(lock = %lock.name, version = lock.version, "Lock released");
                }
                ReleaseOutcome::Stale => {
                    metrics::counter!("idemlock_lock_stale_release_total").increment(1);
                    tracing::warn!(
                        lock = %lock.name,
                        version = lock.version,
                        "Lock was reclaimed before release"
                    );
                }
            }
            Ok(outcome)
        }
        .instrument(log.clone())
        .await
    }

    async fn renew(&self, log: &Span, lock: &Lock, lease: Duration) -> Result<Lock> {
        async move {
            require_lease(lease)?;
            let now = db_now();
            let expires_at = expiry_after(now, lease);
            match self.move_expiry(lock, expires_at).await? {
                1 => {
                    self.stats.renewed();
                    tracing::debug!(lock = %lock.name, version = lock.version + 1, "Lock renewed");
                    Ok(Lock {
                        name: lock.name.clone(),
                        version: lock.version + 1,
                        acquired_at: lock.acquired_at,
                        expires_at,
                    })
                }
                0 => {
                    tracing::warn!(lock = %lock.name, version = lock.version, "Lock lost before renewal");
                    Err(IdemError::LeaseLost {
                        key: lock.name.clone(),
                        version: lock.version,
                    })
                }
                actual => {
                    tracing::error!(lock = %lock.name, actual, "Lock renewal touched more than one row");
                    Err(IdemError::RowCountMismatch {
                        key: lock.name.clone(),
                        expected: 1,
                        actual,
                    })
                }
            }
        }
        .instrument(log.clone())
        .await
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>> {
        Ok(repository::lock::find(&self.db, &self.config.table_name, name).await?)
    }

    fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }
}
