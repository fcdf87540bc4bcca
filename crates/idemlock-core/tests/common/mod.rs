//! Shared helpers for idemlock-core integration tests

#![allow(dead_code)]

use std::time::Duration;

use idemlock_core::{LockConfig, RecordTableConfig, StandaloneConfig};
use idemlock_persistence::sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
};
use idemlock_persistence::{create_idempotency_table, create_lock_table};
use tracing::Span;

pub const RECORD_TABLE: &str = "request_record";
pub const LOCK_TABLE: &str = "lock";

/// In-memory SQLite with both managed tables.
///
/// One pooled connection so every task sees the same database; concurrent
/// callers queue for it the way they would queue on row locks.
pub async fn memory_db() -> DatabaseConnection {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(opts)
        .await
        .expect("Failed to open in-memory SQLite");
    create_idempotency_table(&db, RECORD_TABLE)
        .await
        .expect("Failed to create record table");
    create_lock_table(&db, LOCK_TABLE)
        .await
        .expect("Failed to create lock table");
    db
}

pub fn span(name: &str) -> Span {
    tracing::info_span!("test", case = name)
}

pub fn standalone_config(lease: Duration, wait: Duration) -> StandaloneConfig {
    StandaloneConfig::new(RecordTableConfig::new(RECORD_TABLE))
        .with_lease_timeout(lease)
        .with_lock_wait_timeout(wait)
        .with_poll_interval(Duration::from_millis(10), Duration::from_millis(40))
}

pub fn lock_config(duration: Duration, attempts: u32, timeout: Duration) -> LockConfig {
    LockConfig::new(LOCK_TABLE)
        .with_lock_duration(duration)
        .with_attempts(attempts, timeout)
        .with_retry_backoff(Duration::from_millis(20))
}

/// Add a unique index on `version`. Every later insert then conflicts on the
/// managed table while no row exists for its own key, which is what a row
/// deleted by a cleanup job between the conflict and the read looks like.
pub async fn unique_version_index(db: &DatabaseConnection, table: &str) {
    db.execute_unprepared(&format!(
        "CREATE UNIQUE INDEX {table}_one_version ON {table} (version)"
    ))
    .await
    .expect("Failed to create unique version index");
}
