//! Error types for idemlock
//!
//! Every fallible operation in the workspace returns [`IdemError`]. Storage
//! failures keep the original `DbErr` as their source so callers can still
//! inspect driver details.

use std::time::Duration;

use sea_orm::DbErr;

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum IdemError {
    /// One or more configuration values are invalid. Raised before any store access.
    #[error("invalid configuration: {}", .0.join("; "))]
    ConfigurationInvalid(Vec<String>),

    /// The store could not be reached or no pooled connection was available.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] DbErr),

    /// Any other store error, propagated unchanged.
    #[error("storage error: {0}")]
    Storage(#[source] DbErr),

    /// A unique constraint fired on something other than the managed table.
    #[error("unexpected unique constraint violation outside table '{table}': {message}")]
    UniqueConstraintUnexpected { table: String, message: String },

    /// A conflict proved the row existed but the follow-up read found nothing.
    #[error("record '{key}' vanished between conflict and read")]
    RecordVanished { key: String },

    #[error("gave up waiting for the lease on '{key}' after {waited:?}")]
    LockWaitTimeoutExceeded { key: String, waited: Duration },

    #[error("lock '{name}' unavailable after {attempts} attempt(s)")]
    LockUnavailable { name: String, attempts: u32 },

    #[error("update of '{key}' affected {actual} row(s), expected {expected}")]
    RowCountMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// The CAS-guarded mutation found the version already moved on.
    #[error("lease on '{key}' lost: version {version} is no longer current")]
    LeaseLost { key: String, version: i64 },

    #[error("task type '{0}' is not registered")]
    UnknownTaskType(String),

    #[error("task of type '{task_type}' failed: {source}")]
    TaskFailed {
        task_type: String,
        #[source]
        source: anyhow::Error,
    },
}

impl IdemError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IdemError::StorageUnavailable(_)
                | IdemError::RecordVanished { .. }
                | IdemError::LockWaitTimeoutExceeded { .. }
                | IdemError::LockUnavailable { .. }
        )
    }

    /// The underlying store error, if any.
    pub fn db_err(&self) -> Option<&DbErr> {
        match self {
            IdemError::StorageUnavailable(e) | IdemError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbErr> for IdemError {
    fn from(err: DbErr) -> Self {
        match err {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => IdemError::StorageUnavailable(err),
            other => IdemError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdemError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::RuntimeErr;

    #[test]
    fn test_connection_errors_are_unavailable() {
        let err: IdemError = DbErr::Conn(RuntimeErr::Internal("refused".to_string())).into();
        assert!(matches!(err, IdemError::StorageUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_errors_propagate_unchanged() {
        let err: IdemError = DbErr::Custom("boom".to_string()).into();
        match &err {
            IdemError::Storage(DbErr::Custom(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_retryable());
        assert!(err.db_err().is_some());
    }

    #[test]
    fn test_configuration_message_lists_every_violation() {
        let err = IdemError::ConfigurationInvalid(vec![
            "lock wait timeout must be positive".to_string(),
            "table name required".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid configuration: lock wait timeout must be positive; table name required"
        );
    }

    #[test]
    fn test_task_failure_keeps_source() {
        let err = IdemError::TaskFailed {
            task_type: "email".to_string(),
            source: anyhow::anyhow!("smtp down"),
        };
        assert_eq!(err.to_string(), "task of type 'email' failed: smtp down");
        assert!(std::error::Error::source(&err).is_some());
    }
}
