//! Embedded idempotency coordinator
//!
//! Runs inside a transaction the caller already holds, so the record insert
//! and the caller's side effects commit or roll back together. A savepoint
//! around the insert keeps the caller's transaction usable after a conflict.
//!
//! Under Read Committed two transactions racing on a new key can both observe
//! an absent result until the first commits. Callers that cannot accept that
//! window use [`StandaloneCoordinator`](super::StandaloneCoordinator).

use idemlock_common::config::{RecordTableConfig, require_name};
use idemlock_common::{IdemError, Result};
use idemlock_persistence::repository;
use idemlock_persistence::sea_orm::{ConnectionTrait, DatabaseTransaction, TransactionTrait};
use idemlock_persistence::{
    IDEMPOTENCY_COLUMNS, IdempotencyRecord, InsertConflict, classify_insert_error, db_now,
    verify_table,
};
use tracing::{Instrument, Span};

#[derive(Debug, Clone)]
pub struct EmbeddedCoordinator {
    config: RecordTableConfig,
}

impl EmbeddedCoordinator {
    /// Validates `config`; no store access happens here.
    pub fn new(config: RecordTableConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(table = %config.table_name, "Embedded idempotency coordinator created");
        Ok(Self { config })
    }

    pub fn config(&self) -> &RecordTableConfig {
        &self.config
    }

    /// How long terminal records should be kept. Enforced by an external
    /// cleanup job, never here.
    pub fn retention_period(&self) -> std::time::Duration {
        self.config.retention_period
    }

    pub async fn verify_schema<C: ConnectionTrait>(&self, conn: &C) -> Result<()> {
        verify_table(conn, &self.config.table_name, &IDEMPOTENCY_COLUMNS).await
    }

    /// Insert the record for `key` or return the one that already exists.
    ///
    /// A returned record without a result means either this caller is the
    /// first writer or another transaction is still producing it.
    pub async fn get(
        &self,
        log: &Span,
        txn: &DatabaseTransaction,
        key: &str,
    ) -> Result<IdempotencyRecord> {
        require_name("idempotency key", key)?;
        let table = self.config.table_name.as_str();
        async move {
            let now = db_now();
            let savepoint = txn.begin().await?;
            let inserted = repository::idempotency::insert_unleased(&savepoint, table, key, now).await;

            match inserted {
                Ok(()) => {
                    savepoint.commit().await?;
                    metrics::counter!("idemlock_record_inserted_total", "mode" => "embedded")
                        .increment(1);
                    tracing::debug!(key, "New record inserted");
                    Ok(IdempotencyRecord::pending(key, now))
                }
                Err(db_err) => {
                    let rolled_back = savepoint.rollback().await;
                    match classify_insert_error(db_err.into(), table) {
                        InsertConflict::Expected => {
                            rolled_back?;
                            let record = repository::idempotency::find(txn, table, key)
                                .await?
                                .ok_or_else(|| {
                                    tracing::warn!(key, "Record vanished after conflict");
                                    IdemError::RecordVanished {
                                        key: key.to_string(),
                                    }
                                })?;
                            tracing::debug!(
                                key,
                                completed = record.is_completed(),
                                "Existing record found"
                            );
                            Ok(record)
                        }
                        InsertConflict::Fatal(err) => {
                            if let Err(rollback_err) = rolled_back {
                                tracing::error!(
                                    error = %rollback_err,
                                    original = %err,
                                    "Savepoint rollback failed"
                                );
                            }
                            Err(err)
                        }
                    }
                }
            }
        }
        .instrument(log.clone())
        .await
    }

    /// Store the result for `key`. Exactly one row must change; completed
    /// records are never overwritten.
    pub async fn set(
        &self,
        log: &Span,
        txn: &DatabaseTransaction,
        key: &str,
        result: impl Into<Vec<u8>>,
    ) -> Result<()> {
        require_name("idempotency key", key)?;
        let table = self.config.table_name.as_str();
        let result = result.into();
        async move {
            let affected =
                repository::idempotency::complete_unversioned(txn, table, key, result, db_now())
                    .await?;
            if affected != 1 {
                tracing::error!(key, affected, "Result update did not affect exactly one row");
                return Err(IdemError::RowCountMismatch {
                    key: key.to_string(),
                    expected: 1,
                    actual: affected,
                });
            }
            metrics::counter!("idemlock_record_completed_total", "mode" => "embedded").increment(1);
            tracing::debug!(key, "Result stored");
            Ok(())
        }
        .instrument(log.clone())
        .await
    }
}
