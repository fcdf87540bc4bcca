//! idemlock Core - Idempotency coordinators and named lease locks
//!
//! This crate provides:
//! - `EmbeddedCoordinator`: exactly-once records inside the caller's transaction
//! - `StandaloneCoordinator`: records guarded by a reclaimable lease
//! - `DbLockService`: named, versioned, time-leased locks
//! - `TaskRegistry`: handler lookup by task type
//!
//! Every caller-facing operation takes a `&tracing::Span` carrying whatever
//! request-scoped fields the caller wants attached to its events.

mod lease;

pub mod idempotency;
pub mod lock;
pub mod task;

pub use idempotency::{EmbeddedCoordinator, StandaloneCoordinator};
pub use lock::{DbLockService, Lock, LockStats, NamedLockService, ReleaseOutcome};
pub use task::{Task, TaskHandler, TaskRegistry, TaskStatus};

pub use idemlock_common::config::{LockConfig, RecordTableConfig, StandaloneConfig};
pub use idemlock_common::{IdemError, Result};
pub use idemlock_persistence::{IdempotencyRecord, LeaseState, LockRecord};
