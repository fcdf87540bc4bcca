//! Transactional executor
//!
//! Begins a transaction at a chosen isolation level, runs a unit of work and
//! commits it, or rolls back and hands back the original error. A failed
//! rollback is logged and never replaces that error.
//!
//! Both coordinators run at Read Committed. Serializable turns the
//! insert-then-read-on-conflict pattern into spurious serialization failures
//! and is not supported.

use futures::future::BoxFuture;
use idemlock_common::{IdemError, Result};
use sea_orm::{DatabaseTransaction, IsolationLevel, SqlErr, TransactionTrait};

/// The isolation level every idempotency and lock operation runs at.
pub const REQUIRED_ISOLATION: IsolationLevel = IsolationLevel::ReadCommitted;

/// Begin a transaction at `isolation`.
pub async fn begin<C: TransactionTrait>(
    db: &C,
    isolation: IsolationLevel,
) -> Result<DatabaseTransaction> {
    let txn = db.begin_with_config(Some(isolation), None).await?;
    Ok(txn)
}

/// Commit on success, roll back on failure. The error returned is always the
/// one produced by the unit of work.
pub async fn finish<T>(txn: DatabaseTransaction, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::error!(
                    error = %rollback_err,
                    original = %err,
                    "Transaction rollback failed"
                );
            }
            Err(err)
        }
    }
}

/// Run `work` inside a fresh transaction.
///
/// The closure receives the open transaction and must return a boxed future
/// borrowing it; capture owned values (`move`) rather than references.
pub async fn run_in_transaction<C, F, T>(db: &C, isolation: IsolationLevel, work: F) -> Result<T>
where
    C: TransactionTrait,
    F: for<'c> FnOnce(&'c DatabaseTransaction) -> BoxFuture<'c, Result<T>> + Send,
    T: Send,
{
    let txn = begin(db, isolation).await?;
    let outcome = work(&txn).await;
    finish(txn, outcome).await
}

/// How a failed insert into a managed table is handled.
#[derive(Debug)]
pub enum InsertConflict {
    /// The key already exists in the managed table. This is the ordinary
    /// concurrency signal and drives the read/retry path.
    Expected,
    /// Anything else. Unique violations on other tables arrive here as
    /// `UniqueConstraintUnexpected`.
    Fatal(IdemError),
}

/// Classify the error of an insert into `table`.
pub fn classify_insert_error(err: IdemError, table: &str) -> InsertConflict {
    let message = match err.db_err().and_then(|e| e.sql_err()) {
        Some(SqlErr::UniqueConstraintViolation(message)) => message,
        _ => return InsertConflict::Fatal(err),
    };

    if names_table(&message, table) {
        tracing::debug!(table, "Unique constraint hit on managed table");
        InsertConflict::Expected
    } else {
        tracing::error!(table, message = %message, "Unique constraint violated on an unmanaged table");
        InsertConflict::Fatal(IdemError::UniqueConstraintUnexpected {
            table: table.to_string(),
            message,
        })
    }
}

/// Whether a driver's unique-violation message refers to `table`.
///
/// PostgreSQL names the `<table>_pkey` constraint, SQLite reports
/// `<table>.<column>` and MySQL 8 reports `'<table>.PRIMARY'`. Older MySQL
/// only says `'PRIMARY'`, which the single-table inserts here can only hit on
/// the managed table itself.
pub fn names_table(message: &str, table: &str) -> bool {
    let message = message.to_ascii_lowercase();
    let table = table.to_ascii_lowercase();
    contains_identifier(&message, &format!("{}.", table))
        || contains_identifier(&message, &format!("{}_pkey", table))
        || message.contains("for key 'primary'")
}

/// `needle` occurs at an identifier boundary, so `xlock.` does not match `lock.`.
fn contains_identifier(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(at, _)| {
        haystack[..at]
            .chars()
            .next_back()
            .is_none_or(|c| !(c.is_ascii_alphanumeric() || c == '_'))
    })
}
