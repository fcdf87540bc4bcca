// Named lock service
// Time-leased, versioned locks stored as rows of a lock table

pub mod model;
pub mod service;

pub use model::{Lock, LockStats, ReleaseOutcome};
pub use service::{DbLockService, NamedLockService};
