//! idemlock Persistence - Storage layer for the idempotency and lock tables
//!
//! This crate provides:
//! - The transactional executor and unique-violation classification
//! - Row types for both managed tables
//! - Statements addressed by a runtime table name
//! - Schema creation and verification helpers

pub mod executor;
pub mod model;
pub mod repository;
pub mod schema;

// Re-export sea-orm for convenience
pub use sea_orm;

pub use executor::{
    InsertConflict, REQUIRED_ISOLATION, begin, classify_insert_error, finish, run_in_transaction,
};
pub use model::{IdempotencyRecord, LeaseState, LockRecord, db_now, lease_state};
pub use schema::{
    IDEMPOTENCY_COLUMNS, LOCK_COLUMNS, create_idempotency_table, create_lock_table, verify_table,
};
