//! Demo scenarios
//!
//! Each request runs a mock operation guarded by one of the coordinators: it
//! waits a little, then inserts a row into the `resource` table. Counting the
//! rows per key afterwards shows whether the operation ran exactly once.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::ValueEnum;
use futures::future::join_all;
use idemlock_core::{
    DbLockService, EmbeddedCoordinator, NamedLockService, StandaloneCoordinator,
};
use idemlock_persistence::{
    REQUIRED_ISOLATION, begin, create_idempotency_table, create_lock_table, db_now,
};
use sea_orm::sea_query::{Alias, ColumnDef, Expr, Query, Table};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, DeriveIden, FromQueryResult,
};
use tracing::Span;

use crate::settings::Configuration;

pub const LOCK_SMOKE_NAME: &str = "smoke";
const LOCK_SMOKE_CALLERS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    /// The same key twice, one after the other
    Sequential,
    /// Two concurrent callers on one key
    Parallel,
    /// Six concurrent callers spread over two keys
    MultiParallel,
    /// Like multi-parallel, but every operation on the first key fails
    MultiParallelWithFail,
    /// Concurrent callers taking turns on one named lock
    LockSmoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Embedded,
    Standalone,
}

/// One planned request: who calls, for which key, and whether its work fails.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Request {
    caller: String,
    key: &'static str,
    fail: bool,
}

impl Scenario {
    fn plan(&self) -> Vec<Request> {
        let request = |caller: usize, key, fail| Request {
            caller: format!("T{}", caller),
            key,
            fail,
        };
        match self {
            Scenario::Sequential => vec![request(1, "0001", false), request(1, "0001", false)],
            Scenario::Parallel => vec![request(1, "0002", false), request(2, "0002", false)],
            Scenario::MultiParallel => (0..6)
                .map(|i| request(i, if i % 2 == 0 { "0003" } else { "0004" }, false))
                .collect(),
            Scenario::MultiParallelWithFail => (0..6)
                .map(|i| {
                    if i % 2 == 0 {
                        request(i, "0005", true)
                    } else {
                        request(i, "0006", false)
                    }
                })
                .collect(),
            Scenario::LockSmoke => Vec::new(),
        }
    }

    /// Side effects each key must end up with.
    fn expected(&self) -> BTreeMap<String, i64> {
        let mut expected = BTreeMap::new();
        for request in self.plan() {
            let count = if request.fail { 0 } else { 1 };
            expected.insert(request.key.to_string(), count);
        }
        expected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Performed,
    Reused,
    SimulatedFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub mode: Mode,
    pub requests: usize,
    pub performed: usize,
    pub reused: usize,
    pub simulated_failures: usize,
    pub errors: Vec<String>,
    /// Resource rows per key
    pub side_effects: BTreeMap<String, i64>,
    pub expected: BTreeMap<String, i64>,
    /// Most lock holders observed at once (lock-smoke only)
    pub max_concurrent_holders: usize,
}

impl ScenarioReport {
    fn new(scenario: Scenario, mode: Mode) -> Self {
        Self {
            scenario,
            mode,
            requests: 0,
            performed: 0,
            reused: 0,
            simulated_failures: 0,
            errors: Vec::new(),
            side_effects: BTreeMap::new(),
            expected: scenario.expected(),
            max_concurrent_holders: 0,
        }
    }

    fn record(&mut self, outcome: anyhow::Result<Outcome>) {
        self.requests += 1;
        match outcome {
            Ok(Outcome::Performed) => self.performed += 1,
            Ok(Outcome::Reused) => self.reused += 1,
            Ok(Outcome::SimulatedFailure) => self.simulated_failures += 1,
            Err(err) => self.errors.push(format!("{:#}", err)),
        }
    }

    /// Every key saw exactly the expected side effects and no lock was shared.
    pub fn is_consistent(&self) -> bool {
        self.side_effects == self.expected && self.max_concurrent_holders <= 1
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "scenario {:?} ({:?}): {} requests, {} performed, {} reused, {} simulated failures, {} errors",
            self.scenario,
            self.mode,
            self.requests,
            self.performed,
            self.reused,
            self.simulated_failures,
            self.errors.len()
        )?;
        for (key, count) in &self.side_effects {
            let expected = self.expected.get(key).copied().unwrap_or_default();
            writeln!(f, "  {}: {} side effect(s), expected {}", key, count, expected)?;
        }
        for err in &self.errors {
            writeln!(f, "  error: {}", err)?;
        }
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Resource {
    Table,
    Id,
    RequestKey,
    Detail,
    CreatedAt,
}

#[derive(Debug, FromQueryResult)]
struct Count {
    n: i64,
}

async fn insert_resource<C: ConnectionTrait>(conn: &C, key: &str, detail: &str) -> Result<(), DbErr> {
    let stmt = Query::insert()
        .into_table(Resource::Table)
        .columns([Resource::Id, Resource::RequestKey, Resource::Detail, Resource::CreatedAt])
        .values([
            uuid::Uuid::new_v4().to_string().into(),
            key.into(),
            detail.into(),
            db_now().into(),
        ])
        .map_err(|e| DbErr::Custom(e.to_string()))?
        .to_owned();
    conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(())
}

async fn rollback_quietly(txn: DatabaseTransaction) {
    if let Err(err) = txn.rollback().await {
        tracing::error!(error = %err, "Transaction rollback failed");
    }
}

/// Runs scenarios against one database with both coordinators and the lock
/// service configured from the same [`Configuration`].
#[derive(Clone)]
pub struct ScenarioRunner {
    db: DatabaseConnection,
    record_table: String,
    lock_table: String,
    embedded: EmbeddedCoordinator,
    standalone: StandaloneCoordinator,
    locks: DbLockService,
    work_delay: Duration,
}

impl ScenarioRunner {
    pub fn new(db: DatabaseConnection, configuration: &Configuration) -> idemlock_core::Result<Self> {
        let embedded = EmbeddedCoordinator::new(configuration.record_table_config())?;
        let standalone = StandaloneCoordinator::new(db.clone(), configuration.standalone_config())?;
        let locks = DbLockService::new(db.clone(), configuration.lock_config())?;
        Ok(Self {
            record_table: embedded.config().table_name.clone(),
            lock_table: locks.config().table_name.clone(),
            db,
            embedded,
            standalone,
            locks,
            work_delay: configuration.work_delay(),
        })
    }

    /// Create the managed tables and the resource table if they are missing.
    pub async fn create_schema(&self) -> anyhow::Result<()> {
        create_idempotency_table(&self.db, &self.record_table).await?;
        create_lock_table(&self.db, &self.lock_table).await?;

        let stmt = Table::create()
            .table(Resource::Table)
            .if_not_exists()
            .col(ColumnDef::new(Resource::Id).string_len(64).not_null().primary_key())
            .col(ColumnDef::new(Resource::RequestKey).string_len(255).not_null())
            .col(ColumnDef::new(Resource::Detail).string_len(255).not_null())
            .col(ColumnDef::new(Resource::CreatedAt).timestamp_with_time_zone().not_null())
            .to_owned();
        self.db.execute(self.db.get_database_backend().build(&stmt)).await?;
        Ok(())
    }

    /// Verify the managed tables, then empty them and the resource table.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.standalone.verify_schema().await?;
        self.locks.verify_schema().await?;

        for table in [self.record_table.as_str(), self.lock_table.as_str(), "resource"] {
            let stmt = Query::delete().from_table(Alias::new(table)).to_owned();
            let res = self.db.execute(self.db.get_database_backend().build(&stmt)).await?;
            tracing::info!(table, deleted = res.rows_affected(), "Table cleaned");
        }
        Ok(())
    }

    pub async fn run(&self, scenario: Scenario, mode: Mode) -> anyhow::Result<ScenarioReport> {
        tracing::info!(?scenario, ?mode, "Scenario started");
        let mut report = ScenarioReport::new(scenario, mode);

        match scenario {
            Scenario::LockSmoke => self.lock_smoke(&mut report).await,
            Scenario::Sequential => {
                for request in scenario.plan() {
                    report.record(self.request(mode, &request).await);
                }
            }
            _ => {
                let plan = scenario.plan();
                let outcomes = join_all(plan.iter().map(|request| self.request(mode, request))).await;
                for outcome in outcomes {
                    report.record(outcome);
                }
            }
        }

        for key in report.expected.keys().cloned().collect::<Vec<_>>() {
            let count = self.side_effects(&key).await?;
            report.side_effects.insert(key, count);
        }

        tracing::info!(
            ?scenario,
            performed = report.performed,
            reused = report.reused,
            errors = report.errors.len(),
            consistent = report.is_consistent(),
            "Scenario finished"
        );
        Ok(report)
    }

    async fn request(&self, mode: Mode, request: &Request) -> anyhow::Result<Outcome> {
        let log = tracing::info_span!("request", key = request.key, caller = %request.caller, ?mode);
        let detail = format!(
            "Request {}, caller {}, with fail {}",
            request.key, request.caller, request.fail
        );
        match mode {
            Mode::Embedded => self.request_embedded(&log, request.key, &detail, request.fail).await,
            Mode::Standalone => {
                self.request_standalone(&log, request.key, &detail, request.fail)
                    .await
            }
        }
    }

    async fn request_embedded(
        &self,
        log: &Span,
        key: &str,
        detail: &str,
        fail: bool,
    ) -> anyhow::Result<Outcome> {
        let txn = begin(&self.db, REQUIRED_ISOLATION).await?;
        let record = match self.embedded.get(log, &txn, key).await {
            Ok(record) => record,
            Err(err) => {
                rollback_quietly(txn).await;
                return Err(err.into());
            }
        };

        if record.is_completed() {
            txn.commit().await?;
            return Ok(Outcome::Reused);
        }

        tokio::time::sleep(self.work_delay).await;
        let work = async {
            insert_resource(&txn, key, detail).await?;
            self.embedded
                .set(log, &txn, key, format!("Time: {}", db_now()).into_bytes())
                .await?;
            anyhow::Ok(())
        }
        .await;

        match work {
            Ok(()) if fail => {
                txn.rollback().await?;
                Ok(Outcome::SimulatedFailure)
            }
            Ok(()) => {
                txn.commit().await?;
                Ok(Outcome::Performed)
            }
            Err(err) => {
                rollback_quietly(txn).await;
                Err(err)
            }
        }
    }

    async fn request_standalone(
        &self,
        log: &Span,
        key: &str,
        detail: &str,
        fail: bool,
    ) -> anyhow::Result<Outcome> {
        let record = self.standalone.get(log, key).await?;
        if record.is_completed() {
            return Ok(Outcome::Reused);
        }

        tokio::time::sleep(self.work_delay).await;
        let txn = begin(&self.db, REQUIRED_ISOLATION).await?;
        if let Err(err) = insert_resource(&txn, key, detail).await {
            rollback_quietly(txn).await;
            self.standalone.release(log, &record).await?;
            return Err(err.into());
        }

        if fail {
            txn.rollback().await?;
            self.standalone.release(log, &record).await?;
            return Ok(Outcome::SimulatedFailure);
        }

        txn.commit().await?;
        self.standalone
            .set(log, &record, format!("Time: {}", db_now()).into_bytes())
            .await?;
        Ok(Outcome::Performed)
    }

    async fn lock_smoke(&self, report: &mut ScenarioReport) {
        let holders = AtomicUsize::new(0);
        let max_holders = AtomicUsize::new(0);

        let callers = (0..LOCK_SMOKE_CALLERS).map(|i| {
            let (holders, max_holders) = (&holders, &max_holders);
            async move {
                let log = tracing::info_span!("lock", caller = i);
                let lock = self.locks.acquire(&log, LOCK_SMOKE_NAME).await?;

                let now_holding = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_holders.fetch_max(now_holding, Ordering::SeqCst);
                tokio::time::sleep(self.work_delay).await;
                let work = insert_resource(&self.db, LOCK_SMOKE_NAME, &format!("caller {}", i)).await;
                holders.fetch_sub(1, Ordering::SeqCst);

                let released = self.locks.release(&log, &lock).await?;
                work?;
                if !released.is_released() {
                    anyhow::bail!("lock lease expired while caller {} held it", i);
                }
                anyhow::Ok(Outcome::Performed)
            }
        });

        for outcome in join_all(callers).await {
            report.record(outcome);
        }
        report.max_concurrent_holders = max_holders.load(Ordering::SeqCst);
        report
            .expected
            .insert(LOCK_SMOKE_NAME.to_string(), report.performed as i64);
    }

    async fn side_effects(&self, key: &str) -> anyhow::Result<i64> {
        let stmt = Query::select()
            .expr_as(Expr::col(Resource::Id).count(), Alias::new("n"))
            .from(Resource::Table)
            .and_where(Expr::col(Resource::RequestKey).eq(key))
            .to_owned();
        let count = Count::find_by_statement(self.db.get_database_backend().build(&stmt))
            .one(&self.db)
            .await?
            .map(|c| c.n)
            .unwrap_or(0);
        Ok(count)
    }
}
