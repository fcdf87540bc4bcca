//! Runner scenarios against in-memory SQLite

use std::io::Write;
use std::time::Duration;

use clap::Parser;
use config::{Config, File, FileFormat};
use idemlock_server::scenarios::{Mode, Scenario, ScenarioRunner};
use idemlock_server::settings::{Cli, Configuration};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

const TEST_CONFIG: &str = r#"
idemlock:
  standalone:
    lockWaitTimeoutMs: 3000
    leaseTimeoutMs: 2000
    pollIntervalMs: 10
    maxPollIntervalMs: 40
  lock:
    lockDurationMs: 2000
    maxAttempts: 10
    attemptTimeoutMs: 3000
    retryBackoffMs: 10
scenario:
  workDelayMs: 20
"#;

fn configuration() -> Configuration {
    Configuration {
        config: Config::builder()
            .add_source(File::from_str(TEST_CONFIG, FileFormat::Yaml))
            .build()
            .unwrap(),
    }
}

async fn runner() -> ScenarioRunner {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db: DatabaseConnection = Database::connect(opts).await.unwrap();

    let runner = ScenarioRunner::new(db, &configuration()).unwrap();
    runner.create_schema().await.unwrap();
    runner.reset().await.unwrap();
    runner
}

#[tokio::test]
async fn test_sequential_reuses_result_in_both_modes() {
    for mode in [Mode::Embedded, Mode::Standalone] {
        let runner = runner().await;
        let report = runner.run(Scenario::Sequential, mode).await.unwrap();

        assert_eq!(report.requests, 2);
        assert_eq!(report.performed, 1, "{report}");
        assert_eq!(report.reused, 1, "{report}");
        assert!(report.is_consistent(), "{report}");
    }
}

#[tokio::test]
async fn test_parallel_callers_single_side_effect() {
    for mode in [Mode::Embedded, Mode::Standalone] {
        let runner = runner().await;
        let report = runner.run(Scenario::Parallel, mode).await.unwrap();

        assert!(report.errors.is_empty(), "{report}");
        assert_eq!(report.side_effects.get("0002"), Some(&1));
        assert!(report.is_consistent(), "{report}");
    }
}

#[tokio::test]
async fn test_multi_parallel_one_side_effect_per_key() {
    let runner = runner().await;
    let report = runner
        .run(Scenario::MultiParallel, Mode::Standalone)
        .await
        .unwrap();

    assert_eq!(report.requests, 6);
    assert_eq!(report.performed, 2, "{report}");
    assert_eq!(report.reused, 4, "{report}");
    assert!(report.is_consistent(), "{report}");
}

#[tokio::test]
async fn test_failed_operations_leave_no_side_effect() {
    for mode in [Mode::Embedded, Mode::Standalone] {
        let runner = runner().await;
        let report = runner
            .run(Scenario::MultiParallelWithFail, mode)
            .await
            .unwrap();

        assert!(report.errors.is_empty(), "{report}");
        assert_eq!(report.simulated_failures, 3, "{report}");
        assert_eq!(report.side_effects.get("0005"), Some(&0));
        assert_eq!(report.side_effects.get("0006"), Some(&1));
        assert!(report.is_consistent(), "{report}");
    }
}

#[tokio::test]
async fn test_lock_smoke_never_shares_the_lock() {
    let runner = runner().await;
    let report = runner.run(Scenario::LockSmoke, Mode::Standalone).await.unwrap();

    assert!(report.errors.is_empty(), "{report}");
    assert_eq!(report.performed, 6);
    assert_eq!(report.max_concurrent_holders, 1);
    assert!(report.is_consistent(), "{report}");
}

#[tokio::test]
async fn test_reset_clears_previous_run() {
    let runner = runner().await;
    runner.run(Scenario::Sequential, Mode::Embedded).await.unwrap();
    runner.reset().await.unwrap();

    let report = runner.run(Scenario::Sequential, Mode::Embedded).await.unwrap();
    assert_eq!(report.performed, 1, "{report}");
    assert_eq!(report.side_effects.get("0001"), Some(&1));
}

#[test]
fn test_configuration_loaded_from_file() {
    let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
    file.write_all(TEST_CONFIG.as_bytes()).unwrap();

    let cli = Cli::parse_from([
        "idemlock",
        "--config",
        file.path().to_str().unwrap(),
        "--db-url",
        "sqlite::memory:",
    ]);
    let configuration = Configuration::from_cli(&cli).unwrap();

    assert_eq!(configuration.database_url().unwrap(), "sqlite::memory:");
    assert_eq!(configuration.work_delay(), Duration::from_millis(20));
    assert_eq!(configuration.lock_config().max_attempts, 10);
    assert_eq!(
        configuration.standalone_config().poll_interval,
        Duration::from_millis(10)
    );
}

#[test]
fn test_missing_config_file_is_ignored() {
    let cli = Cli::parse_from(["idemlock", "--config", "/nonexistent/idemlock.yml"]);
    let configuration = Configuration::from_cli(&cli).unwrap();
    assert_eq!(configuration.work_delay(), Duration::from_secs(1));
}
