//! Standalone idempotency coordinator
//!
//! Owns its transactions and serializes work per key through a lease on the
//! record itself. The first caller to insert owns the lease; later callers
//! poll until a result appears, the lease expires and can be claimed, or the
//! wait timeout runs out. A crashed owner therefore blocks others for at most
//! one lease timeout.

use std::time::Duration;

use idemlock_common::config::{StandaloneConfig, require_name};
use idemlock_common::{IdemError, Result};
use idemlock_persistence::repository;
use idemlock_persistence::sea_orm::DatabaseConnection;
use idemlock_persistence::{
    IDEMPOTENCY_COLUMNS, IdempotencyRecord, InsertConflict, LeaseState, REQUIRED_ISOLATION,
    classify_insert_error, db_now, run_in_transaction, verify_table,
};
use tokio::time::Instant;
use tracing::{Instrument, Span};

use crate::lease::{Backoff, Claim, expiry_after};

/// What one poll of an existing record observed.
#[derive(Debug)]
enum Observed {
    Completed(IdempotencyRecord),
    Lease(Claim<IdempotencyRecord>),
}

#[derive(Debug, Clone)]
pub struct StandaloneCoordinator {
    db: DatabaseConnection,
    config: StandaloneConfig,
}

impl StandaloneCoordinator {
    /// Validates `config` before anything touches the store.
    pub fn new(db: DatabaseConnection, config: StandaloneConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            table = %config.table.table_name,
            lease_timeout_ms = config.lease_timeout.as_millis() as u64,
            lock_wait_timeout_ms = config.lock_wait_timeout.as_millis() as u64,
            "Standalone idempotency coordinator created"
        );
        Ok(Self { db, config })
    }

    pub fn config(&self) -> &StandaloneConfig {
        &self.config
    }

    /// How long terminal records should be kept. Enforced by an external
    /// cleanup job, never here.
    pub fn retention_period(&self) -> Duration {
        self.config.table.retention_period
    }

    pub async fn verify_schema(&self) -> Result<()> {
        verify_table(&self.db, self.table(), &IDEMPOTENCY_COLUMNS).await
    }

    fn table(&self) -> &str {
        &self.config.table.table_name
    }

    /// Obtain the record for `key`.
    ///
    /// Returns either a record carrying a result, or a record without one
    /// whose lease now belongs to this caller. Only the owner may `set` or
    /// `release` it, passing back the record returned here.
    pub async fn get(&self, log: &Span, key: &str) -> Result<IdempotencyRecord> {
        require_name("idempotency key", key)?;
        async move {
            let now = db_now();
            let record = IdempotencyRecord::pending(key, now)
                .with_lease(expiry_after(now, self.config.lease_timeout));

            let inserted = {
                let (table, record) = (self.table().to_string(), record.clone());
                run_in_transaction(&self.db, REQUIRED_ISOLATION, move |txn| {
                    Box::pin(async move {
                        repository::idempotency::insert_leased(txn, &table, &record).await?;
                        Ok(())
                    })
                })
                .await
            };

            match inserted {
                Ok(()) => {
                    metrics::counter!("idemlock_record_inserted_total", "mode" => "standalone")
                        .increment(1);
                    tracing::debug!(key, "New record inserted, lease taken");
                    Ok(record)
                }
                Err(err) => match classify_insert_error(err, self.table()) {
                    InsertConflict::Expected => {
                        tracing::debug!(key, "Record exists, polling");
                        self.wait_for(key).await
                    }
                    InsertConflict::Fatal(err) => Err(err),
                },
            }
        }
        .instrument(log.clone())
        .await
    }

    /// Poll an existing record until it completes, its lease can be claimed,
    /// or the wait timeout runs out.
    async fn wait_for(&self, key: &str) -> Result<IdempotencyRecord> {
        let started = Instant::now();
        let deadline = started + self.config.lock_wait_timeout;
        let mut backoff = Backoff::new(self.config.poll_interval, self.config.max_poll_interval);

        loop {
            let remaining = match self.observe(key).await? {
                Observed::Completed(record) => {
                    tracing::debug!(key, "Found completed record");
                    return Ok(record);
                }
                Observed::Lease(Claim::Won(record)) => {
                    metrics::counter!("idemlock_record_reclaimed_total").increment(1);
                    tracing::info!(key, version = record.version, "Reclaimed expired lease");
                    return Ok(record);
                }
                Observed::Lease(Claim::Lost) => {
                    tracing::debug!(key, "Lost reclaim race, re-reading");
                    None
                }
                Observed::Lease(Claim::Busy { remaining }) => Some(remaining),
            };

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                metrics::counter!("idemlock_lock_wait_timeout_total").increment(1);
                tracing::warn!(key, waited_ms = waited.as_millis() as u64, "Gave up waiting for lease");
                return Err(IdemError::LockWaitTimeoutExceeded {
                    key: key.to_string(),
                    waited,
                });
            }

            if let Some(lease_left) = remaining {
                let delay = backoff.next_delay().min(deadline - now);
                tracing::debug!(
                    key,
                    lease_left_ms = lease_left.as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    "Lease held, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Read the record and, if its lease is gone, try to claim it.
    async fn observe(&self, key: &str) -> Result<Observed> {
        let table = self.table().to_string();
        let key = key.to_string();
        let lease_timeout = self.config.lease_timeout;
        run_in_transaction(&self.db, REQUIRED_ISOLATION, move |txn| {
            Box::pin(async move {
                let now = db_now();
                let Some(current) = repository::idempotency::find(txn, &table, &key).await? else {
                    tracing::warn!(key = %key, "Record vanished after conflict");
                    return Err(IdemError::RecordVanished { key });
                };

                match current.lease_state(now) {
                    LeaseState::Completed => Ok(Observed::Completed(current)),
                    LeaseState::Held { remaining } => Ok(Observed::Lease(Claim::Busy { remaining })),
                    LeaseState::Reclaimable => {
                        let locked_until = expiry_after(now, lease_timeout);
                        let affected = repository::idempotency::claim(
                            txn,
                            &table,
                            &key,
                            current.version,
                            locked_until,
                            now,
                        )
                        .await?;
                        match affected {
                            0 => Ok(Observed::Lease(Claim::Lost)),
                            1 => Ok(Observed::Lease(Claim::Won(IdempotencyRecord {
                                version: current.version + 1,
                                locked_until: Some(locked_until),
                                updated_at: now,
                                ..current
                            }))),
                            actual => Err(IdemError::RowCountMismatch {
                                key,
                                expected: 1,
                                actual,
                            }),
                        }
                    }
                }
            })
        })
        .await
    }

    /// Store `result` and drop the lease. The record becomes terminal.
    ///
    /// Fails with `LeaseLost` when the lease was reclaimed after `record`
    /// was obtained; the result is not stored in that case.
    pub async fn set(
        &self,
        log: &Span,
        record: &IdempotencyRecord,
        result: impl Into<Vec<u8>>,
    ) -> Result<IdempotencyRecord> {
        let result = result.into();
        async move {
            let now = db_now();
            let affected = {
                let table = self.table().to_string();
                let (key, version, result) = (record.id.clone(), record.version, result.clone());
                run_in_transaction(&self.db, REQUIRED_ISOLATION, move |txn| {
                    Box::pin(async move {
                        let affected = repository::idempotency::complete(
                            txn, &table, &key, version, result, now,
                        )
                        .await?;
                        Ok(affected)
                    })
                })
                .await?
            };

            check_single_row(record, affected, "set")?;
            metrics::counter!("idemlock_record_completed_total", "mode" => "standalone")
                .increment(1);
            tracing::debug!(key = %record.id, version = record.version + 1, "Result stored");
            Ok(IdempotencyRecord {
                result: Some(result),
                version: record.version + 1,
                locked_until: None,
                updated_at: now,
                ..record.clone()
            })
        }
        .instrument(log.clone())
        .await
    }

    /// Drop the lease without a result so the next caller may claim it.
    pub async fn release(&self, log: &Span, record: &IdempotencyRecord) -> Result<IdempotencyRecord> {
        async move {
            let now = db_now();
            let affected = {
                let table = self.table().to_string();
                let (key, version) = (record.id.clone(), record.version);
                run_in_transaction(&self.db, REQUIRED_ISOLATION, move |txn| {
                    Box::pin(async move {
                        let affected =
                            repository::idempotency::unlock(txn, &table, &key, version, now).await?;
                        Ok(affected)
                    })
                })
                .await?
            };

            check_single_row(record, affected, "release")?;
            metrics::counter!("idemlock_record_released_total").increment(1);
            tracing::debug!(key = %record.id, version = record.version + 1, "Lease released");
            Ok(IdempotencyRecord {
                version: record.version + 1,
                locked_until: None,
                updated_at: now,
                ..record.clone()
            })
        }
        .instrument(log.clone())
        .await
    }
}

fn check_single_row(record: &IdempotencyRecord, affected: u64, op: &str) -> Result<()> {
    match affected {
        1 => Ok(()),
        0 => {
            metrics::counter!("idemlock_lease_lost_total").increment(1);
            tracing::warn!(key = %record.id, version = record.version, op, "Lease lost");
            Err(IdemError::LeaseLost {
                key: record.id.clone(),
                version: record.version,
            })
        }
        actual => {
            tracing::error!(key = %record.id, actual, op, "Update affected more than one row");
            Err(IdemError::RowCountMismatch {
                key: record.id.clone(),
                expected: 1,
                actual,
            })
        }
    }
}
