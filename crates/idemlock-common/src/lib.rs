//! idemlock Common - Shared error and configuration types
//!
//! This crate provides the foundational types used across all idemlock components:
//! - The error taxonomy returned by every operation
//! - Validated configuration values for the coordinators and the lock service

pub mod config;
pub mod error;

// Re-exports for convenience
pub use config::{LockConfig, RecordTableConfig, StandaloneConfig};
pub use error::{IdemError, Result};
