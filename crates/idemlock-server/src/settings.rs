// Runner configuration
// Layered from an optional YAML file, IDEMLOCK_* environment variables and command line
// overrides. Environment keys are the full config path after the prefix, `__` separating
// segments: `db.url` is IDEMLOCK_DB__URL, and the coordinator keys, which live under
// `idemlock.`, repeat it: IDEMLOCK_IDEMLOCK__LOCK__MAXATTEMPTS.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use idemlock_common::config::{
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_LEASE_TIMEOUT, DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_DURATION,
    DEFAULT_LOCK_TABLE, DEFAULT_LOCK_WAIT_TIMEOUT, DEFAULT_MAX_POLL_INTERVAL,
    DEFAULT_POLL_INTERVAL, DEFAULT_RECORD_TABLE, DEFAULT_RETENTION_PERIOD, DEFAULT_RETRY_BACKOFF,
};
use idemlock_core::{LockConfig, RecordTableConfig, StandaloneConfig};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

use crate::logging::LoggingConfig;
use crate::scenarios::{Mode, Scenario};

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";
pub const ENV_PREFIX: &str = "IDEMLOCK";

const RECORD_TABLE_NAME: &str = "idemlock.record.tableName";
const RECORD_RETENTION_SEC: &str = "idemlock.record.retentionPeriodSec";
const STANDALONE_LOCK_WAIT_TIMEOUT_MS: &str = "idemlock.standalone.lockWaitTimeoutMs";
const STANDALONE_LEASE_TIMEOUT_MS: &str = "idemlock.standalone.leaseTimeoutMs";
const STANDALONE_POLL_INTERVAL_MS: &str = "idemlock.standalone.pollIntervalMs";
const STANDALONE_MAX_POLL_INTERVAL_MS: &str = "idemlock.standalone.maxPollIntervalMs";
const LOCK_TABLE_NAME: &str = "idemlock.lock.tableName";
const LOCK_DURATION_MS: &str = "idemlock.lock.lockDurationMs";
const LOCK_MAX_ATTEMPTS: &str = "idemlock.lock.maxAttempts";
const LOCK_ATTEMPT_TIMEOUT_MS: &str = "idemlock.lock.attemptTimeoutMs";
const LOCK_RETRY_BACKOFF_MS: &str = "idemlock.lock.retryBackoffMs";
const SCENARIO_WORK_DELAY_MS: &str = "scenario.workDelayMs";

const DEFAULT_WORK_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug, Clone)]
#[command(name = "idemlock", version, about = "Exercise idempotency coordinators and named locks")]
pub struct Cli {
    /// Configuration file; a missing file is ignored
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    #[arg(long = "db-url", env = "DATABASE_URL")]
    pub database_url: Option<String>,
    #[arg(short = 's', long = "scenario", value_enum, default_value_t = Scenario::Sequential)]
    pub scenario: Scenario,
    #[arg(short = 'm', long = "mode", value_enum, default_value_t = Mode::Standalone)]
    pub mode: Mode,
    /// Create the managed tables before running
    #[arg(long = "create-schema")]
    pub create_schema: bool,
}

/// Runner configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(cli.config.clone()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(url) = &cli.database_url {
            builder = builder.set_override("db.url", url.as_str())?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    // ========================================================================
    // Coordinator and lock configuration
    // ========================================================================

    pub fn record_table_config(&self) -> RecordTableConfig {
        RecordTableConfig::new(self.string_or(RECORD_TABLE_NAME, DEFAULT_RECORD_TABLE))
            .with_retention_period(self.secs_or(RECORD_RETENTION_SEC, DEFAULT_RETENTION_PERIOD))
    }

    pub fn standalone_config(&self) -> StandaloneConfig {
        StandaloneConfig::new(self.record_table_config())
            .with_lock_wait_timeout(
                self.millis_or(STANDALONE_LOCK_WAIT_TIMEOUT_MS, DEFAULT_LOCK_WAIT_TIMEOUT),
            )
            .with_lease_timeout(self.millis_or(STANDALONE_LEASE_TIMEOUT_MS, DEFAULT_LEASE_TIMEOUT))
            .with_poll_interval(
                self.millis_or(STANDALONE_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL),
                self.millis_or(STANDALONE_MAX_POLL_INTERVAL_MS, DEFAULT_MAX_POLL_INTERVAL),
            )
    }

    pub fn lock_config(&self) -> LockConfig {
        // Negative counts are clamped to 0 and rejected by validation
        let max_attempts = self
            .config
            .get_int(LOCK_MAX_ATTEMPTS)
            .map(|v| u32::try_from(v).unwrap_or(0))
            .unwrap_or(DEFAULT_LOCK_ATTEMPTS);

        LockConfig::new(self.string_or(LOCK_TABLE_NAME, DEFAULT_LOCK_TABLE))
            .with_lock_duration(self.millis_or(LOCK_DURATION_MS, DEFAULT_LOCK_DURATION))
            .with_attempts(
                max_attempts,
                self.millis_or(LOCK_ATTEMPT_TIMEOUT_MS, DEFAULT_ATTEMPT_TIMEOUT),
            )
            .with_retry_backoff(self.millis_or(LOCK_RETRY_BACKOFF_MS, DEFAULT_RETRY_BACKOFF))
    }

    /// Time each simulated operation spends before producing its side effect
    pub fn work_delay(&self) -> Duration {
        self.millis_or(SCENARIO_WORK_DELAY_MS, DEFAULT_WORK_DELAY)
    }

    // ========================================================================
    // Logging configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logging.dir").ok(),
            self.config.get_bool("logging.console").unwrap_or(true),
            self.config.get_bool("logging.file").unwrap_or(false),
            self.config
                .get_string("logging.level")
                .unwrap_or("info".to_string()),
            self.config
                .get_string("logging.rotation")
                .unwrap_or("daily".to_string()),
        )
    }

    // ========================================================================
    // Database configuration
    // ========================================================================

    pub fn database_url(&self) -> anyhow::Result<String> {
        self.config
            .get_string("db.url")
            .map_err(|_| anyhow::anyhow!("db.url is not configured; pass --db-url or set DATABASE_URL"))
    }

    pub fn connect_options(&self) -> anyhow::Result<ConnectOptions> {
        let max_connections = self
            .config
            .get_int("db.pool.maxConnections")
            .unwrap_or(20) as u32;
        let min_connections = self
            .config
            .get_int("db.pool.minConnections")
            .unwrap_or(1) as u32;
        let connect_timeout = self
            .config
            .get_int("db.pool.connectTimeoutSec")
            .unwrap_or(30) as u64;
        let acquire_timeout = self
            .config
            .get_int("db.pool.acquireTimeoutSec")
            .unwrap_or(8) as u64;
        let sqlx_logging = self
            .config
            .get_bool("db.pool.sqlxLogging")
            .unwrap_or(false);

        let mut opt = ConnectOptions::new(self.database_url()?);

        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .acquire_timeout(Duration::from_secs(acquire_timeout))
            .sqlx_logging(sqlx_logging)
            .sqlx_logging_level(tracing::log::LevelFilter::Debug);

        tracing::info!(
            max_connections = max_connections,
            min_connections = min_connections,
            connect_timeout = connect_timeout,
            acquire_timeout = acquire_timeout,
            sqlx_logging = sqlx_logging,
            "Database connection pool configured"
        );

        Ok(opt)
    }

    pub async fn database_connection(&self) -> anyhow::Result<DatabaseConnection> {
        let database_connection = Database::connect(self.connect_options()?).await?;
        Ok(database_connection)
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.config
            .get_string(key)
            .unwrap_or_else(|_| default.to_string())
    }

    fn millis_or(&self, key: &str, default: Duration) -> Duration {
        self.config
            .get_int(key)
            .map(|v| Duration::from_millis(u64::try_from(v).unwrap_or(0)))
            .unwrap_or(default)
    }

    fn secs_or(&self, key: &str, default: Duration) -> Duration {
        self.config
            .get_int(key)
            .map(|v| Duration::from_secs(u64::try_from(v).unwrap_or(0)))
            .unwrap_or(default)
    }
}
