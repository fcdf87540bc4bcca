//! Configuration values for the coordinators and the lock service
//!
//! Values are plain data. Each type validates eagerly and reports every
//! violation at once, so a broken deployment fails on the first start instead
//! of on the first request.

use std::time::Duration;

use crate::error::{IdemError, Result};

pub const DEFAULT_RECORD_TABLE: &str = "request_record";
pub const DEFAULT_LOCK_TABLE: &str = "lock";

pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(3600);
pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Table holding idempotency records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTableConfig {
    pub table_name: String,
    /// How long terminal records may be kept before an external cleanup job
    /// removes them. Accepted and validated, never enforced here.
    pub retention_period: Duration,
}

impl Default for RecordTableConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_RECORD_TABLE.to_string(),
            retention_period: DEFAULT_RETENTION_PERIOD,
        }
    }
}

impl RecordTableConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }

    pub fn with_retention_period(mut self, retention_period: Duration) -> Self {
        self.retention_period = retention_period;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        self.collect_violations(&mut violations);
        into_result(violations)
    }

    fn collect_violations(&self, violations: &mut Vec<String>) {
        check_table_name(&self.table_name, violations);
        check_positive("retention period", self.retention_period, violations);
    }
}

/// Standalone coordinator configuration: the record table plus the lease
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandaloneConfig {
    pub table: RecordTableConfig,
    /// Upper bound on how long `get` polls for a busy lease.
    pub lock_wait_timeout: Duration,
    /// Lease granted to a new owner.
    pub lease_timeout: Duration,
    /// First sleep between polls; doubles up to `max_poll_interval`.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        Self {
            table: RecordTableConfig::default(),
            lock_wait_timeout: DEFAULT_LOCK_WAIT_TIMEOUT,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
        }
    }
}

impl StandaloneConfig {
    pub fn new(table: RecordTableConfig) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_interval = initial;
        self.max_poll_interval = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        self.table.collect_violations(&mut violations);
        check_positive("lock wait timeout", self.lock_wait_timeout, &mut violations);
        check_positive("lease timeout", self.lease_timeout, &mut violations);
        check_positive("poll interval", self.poll_interval, &mut violations);
        check_positive("max poll interval", self.max_poll_interval, &mut violations);
        if self.max_poll_interval < self.poll_interval {
            violations.push("max poll interval must not be shorter than poll interval".to_string());
        }
        into_result(violations)
    }
}

/// Named lock service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub table_name: String,
    /// Lease granted by `acquire` when the caller does not pass one.
    pub lock_duration: Duration,
    pub max_attempts: u32,
    /// Wall-clock budget for all attempts of one `acquire` call.
    pub attempt_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            table_name: DEFAULT_LOCK_TABLE.to_string(),
            lock_duration: DEFAULT_LOCK_DURATION,
            max_attempts: DEFAULT_LOCK_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl LockConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Default::default()
        }
    }

    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    pub fn with_attempts(mut self, max_attempts: u32, attempt_timeout: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        check_table_name(&self.table_name, &mut violations);
        check_positive("lock duration", self.lock_duration, &mut violations);
        check_positive("lock timeout", self.attempt_timeout, &mut violations);
        check_positive("retry backoff", self.retry_backoff, &mut violations);
        if self.max_attempts == 0 {
            violations.push("lock attempts must be positive".to_string());
        }
        into_result(violations)
    }
}

/// Longest accepted table name. PostgreSQL truncates identifiers to 63 bytes,
/// and the primary key constraint it reports on conflict is `<table>_pkey`.
pub const MAX_TABLE_NAME_LEN: usize = 58;

/// Table names are spliced into statements as identifiers, so only plain
/// identifiers are accepted.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_table_name(name: &str, violations: &mut Vec<String>) {
    if name.is_empty() {
        violations.push("table name required".to_string());
    } else if !is_valid_identifier(name) {
        violations.push(format!("table name '{}' is not a valid identifier", name));
    } else if name.len() > MAX_TABLE_NAME_LEN {
        violations.push(format!(
            "table name '{}' is longer than {} characters",
            name, MAX_TABLE_NAME_LEN
        ));
    }
}

/// Reject an empty idempotency key or lock name before it reaches the store.
pub fn require_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(IdemError::ConfigurationInvalid(vec![format!(
            "{} must not be empty",
            what
        )]));
    }
    Ok(())
}

/// Reject a zero lease passed per call.
pub fn require_lease(lease: Duration) -> Result<()> {
    let mut violations = Vec::new();
    check_positive("lease", lease, &mut violations);
    into_result(violations)
}

fn check_positive(what: &str, value: Duration, violations: &mut Vec<String>) {
    if value.is_zero() {
        violations.push(format!("{} must be positive", what));
    }
}

fn into_result(violations: Vec<String>) -> Result<()> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(IdemError::ConfigurationInvalid(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn violations(result: Result<()>) -> Vec<String> {
        match result {
            Err(IdemError::ConfigurationInvalid(v)) => v,
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(()) => Vec::new(),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(RecordTableConfig::default().validate().is_ok());
        assert!(StandaloneConfig::default().validate().is_ok());
        assert!(LockConfig::default().validate().is_ok());
    }

    #[test]
    fn test_lock_config_table() {
        let cases = [
            (LockConfig::default().with_attempts(3, Duration::ZERO), false),
            (LockConfig::default().with_attempts(0, Duration::from_secs(3)), false),
            (LockConfig::default().with_lock_duration(Duration::ZERO), false),
            (LockConfig::new(""), false),
            (LockConfig::new("LOCK"), true),
        ];
        for (config, valid) in cases {
            assert_eq!(config.validate().is_ok(), valid, "{:?}", config);
        }
    }

    #[test]
    fn test_all_violations_reported_together() {
        let config = StandaloneConfig {
            table: RecordTableConfig {
                table_name: String::new(),
                retention_period: Duration::ZERO,
            },
            lock_wait_timeout: Duration::ZERO,
            lease_timeout: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(10),
        };
        let v = violations(config.validate());
        assert_eq!(v.len(), 4, "{v:?}");
        assert!(v.contains(&"table name required".to_string()));
        assert!(v.contains(&"lease timeout must be positive".to_string()));
    }

    #[test]
    fn test_poll_interval_ordering() {
        let config = StandaloneConfig::default()
            .with_poll_interval(Duration::from_millis(500), Duration::from_millis(100));
        let v = violations(config.validate());
        assert_eq!(v, vec!["max poll interval must not be shorter than poll interval"]);
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("request_record"));
        assert!(is_valid_identifier("_lock2"));
        assert!(!is_valid_identifier("2lock"));
        assert!(!is_valid_identifier("lock; drop table x"));
        assert!(!is_valid_identifier("public.lock"));
    }

    #[test]
    fn test_table_name_length_cap() {
        let longest = "t".repeat(MAX_TABLE_NAME_LEN);
        assert!(RecordTableConfig::new(longest.as_str()).validate().is_ok());

        let too_long = "t".repeat(MAX_TABLE_NAME_LEN + 1);
        let v = violations(LockConfig::new(too_long).validate());
        assert_eq!(v.len(), 1);
        assert!(v[0].contains("longer than 58"));
    }

    #[test]
    fn test_call_arguments() {
        assert_eq!(
            violations(require_name("lock name", "")),
            vec!["lock name must not be empty"]
        );
        assert!(require_name("key", "0001").is_ok());
        assert_eq!(
            violations(require_lease(Duration::ZERO)),
            vec!["lease must be positive"]
        );
        assert!(require_lease(Duration::from_millis(1)).is_ok());
    }

    proptest! {
        #[test]
        fn prop_zero_lease_always_rejected(wait_ms in 0u64..10_000, retention in 0u64..10_000) {
            let config = StandaloneConfig::new(
                RecordTableConfig::new("t").with_retention_period(Duration::from_secs(retention)),
            )
            .with_lock_wait_timeout(Duration::from_millis(wait_ms))
            .with_lease_timeout(Duration::ZERO);
            let v = violations(config.validate());
            prop_assert!(v.contains(&"lease timeout must be positive".to_string()));
        }

        #[test]
        fn prop_positive_lock_config_accepted(
            duration_ms in 1u64..100_000,
            attempts in 1u32..100,
            timeout_ms in 1u64..100_000,
        ) {
            let config = LockConfig::new("lock")
                .with_lock_duration(Duration::from_millis(duration_ms))
                .with_attempts(attempts, Duration::from_millis(timeout_ms));
            prop_assert!(config.validate().is_ok());
        }
    }
}
