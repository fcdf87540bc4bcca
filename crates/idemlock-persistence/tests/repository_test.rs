//! Statements and executor against in-memory SQLite

use chrono::TimeDelta;
use idemlock_common::IdemError;
use idemlock_persistence::repository::{idempotency, lock};
use idemlock_persistence::sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr,
};
use idemlock_persistence::{
    IDEMPOTENCY_COLUMNS, IdempotencyRecord, InsertConflict, LOCK_COLUMNS, LockRecord,
    REQUIRED_ISOLATION, classify_insert_error, create_idempotency_table, create_lock_table,
    db_now, run_in_transaction, verify_table,
};

async fn memory_db() -> DatabaseConnection {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1).min_connections(1).sqlx_logging(false);
    let db = Database::connect(opts).await.unwrap();
    create_idempotency_table(&db, "request_record").await.unwrap();
    create_lock_table(&db, "lock").await.unwrap();
    db
}

#[tokio::test]
async fn test_schema_is_idempotent_and_verifiable() {
    let db = memory_db().await;
    // Creating again is a no-op
    create_idempotency_table(&db, "request_record").await.unwrap();
    create_lock_table(&db, "lock").await.unwrap();

    verify_table(&db, "request_record", &IDEMPOTENCY_COLUMNS).await.unwrap();
    verify_table(&db, "lock", &LOCK_COLUMNS).await.unwrap();
    assert!(verify_table(&db, "missing", &LOCK_COLUMNS).await.is_err());
    assert!(verify_table(&db, "lock", &IDEMPOTENCY_COLUMNS).await.is_err());
}

#[tokio::test]
async fn test_verify_reports_missing_columns() {
    let db = memory_db().await;

    match verify_table(&db, "lock", &["name", "no_such_column"]).await {
        Err(IdemError::Storage(DbErr::Custom(msg))) => {
            assert!(msg.contains("no_such_column"), "{msg}");
            assert!(!msg.contains("name,"), "{msg}");
        }
        other => panic!("unexpected result {other:?}"),
    }
    match verify_table(&db, "missing", &["name"]).await {
        Err(IdemError::Storage(DbErr::Custom(msg))) => assert!(msg.contains("does not exist")),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_key_is_expected_conflict() {
    let db = memory_db().await;
    let now = db_now();
    idempotency::insert_unleased(&db, "request_record", "0001", now).await.unwrap();

    let err: IdemError = idempotency::insert_unleased(&db, "request_record", "0001", now)
        .await
        .unwrap_err()
        .into();
    assert!(matches!(
        classify_insert_error(err, "request_record"),
        InsertConflict::Expected
    ));

    let record = idempotency::find(&db, "request_record", "0001").await.unwrap().unwrap();
    assert_eq!(record, IdempotencyRecord::pending("0001", now));
}

#[tokio::test]
async fn test_versioned_updates_guard_on_version_and_result() {
    let db = memory_db().await;
    let now = db_now();
    let record = IdempotencyRecord::pending("0002", now).with_lease(now + TimeDelta::seconds(30));
    idempotency::insert_leased(&db, "request_record", &record).await.unwrap();

    assert_eq!(idempotency::claim(&db, "request_record", "0002", 7, now, now).await.unwrap(), 0);
    assert_eq!(idempotency::unlock(&db, "request_record", "0002", 1, now).await.unwrap(), 1);
    assert_eq!(
        idempotency::complete(&db, "request_record", "0002", 2, b"r".to_vec(), now)
            .await
            .unwrap(),
        1
    );

    let done = idempotency::find(&db, "request_record", "0002").await.unwrap().unwrap();
    assert_eq!(done.version, 3);
    assert_eq!(done.result(), Some(&b"r"[..]));
    assert!(done.locked_until.is_none());

    // Completed rows never change again
    assert_eq!(idempotency::unlock(&db, "request_record", "0002", 3, now).await.unwrap(), 0);
    assert_eq!(
        idempotency::complete_unversioned(&db, "request_record", "0002", b"x".to_vec(), now)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_lock_compare_and_set() {
    let db = memory_db().await;
    let now = db_now();
    let row = LockRecord {
        name: "smoke".to_string(),
        version: 1,
        expires_at: now + TimeDelta::seconds(5),
    };
    lock::insert(&db, "lock", &row).await.unwrap();

    assert_eq!(lock::compare_and_set(&db, "lock", "smoke", 1, now).await.unwrap(), 1);
    assert_eq!(lock::compare_and_set(&db, "lock", "smoke", 1, now).await.unwrap(), 0);

    let current = lock::find(&db, "lock", "smoke").await.unwrap().unwrap();
    assert_eq!(current.version, 2);
    assert_eq!(current.expires_at, now);
    assert!(current.is_expired(now));
}

#[tokio::test]
async fn test_failed_unit_of_work_rolls_back() {
    let db = memory_db().await;

    let outcome: Result<(), IdemError> = run_in_transaction(&db, REQUIRED_ISOLATION, |txn| {
        Box::pin(async move {
            idempotency::insert_unleased(txn, "request_record", "0003", db_now()).await?;
            Err(IdemError::Storage(DbErr::Custom("work failed".to_string())))
        })
    })
    .await;

    match outcome {
        Err(IdemError::Storage(DbErr::Custom(msg))) => assert_eq!(msg, "work failed"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(idempotency::find(&db, "request_record", "0003").await.unwrap().is_none());
}

#[tokio::test]
async fn test_unique_violation_on_other_table_is_fatal() {
    let db = memory_db().await;
    db.execute_unprepared("CREATE TABLE audit (tag TEXT NOT NULL UNIQUE)")
        .await
        .unwrap();
    db.execute_unprepared("INSERT INTO audit (tag) VALUES ('dup')")
        .await
        .unwrap();

    let err: IdemError = db
        .execute_unprepared("INSERT INTO audit (tag) VALUES ('dup')")
        .await
        .unwrap_err()
        .into();
    match classify_insert_error(err, "request_record") {
        InsertConflict::Fatal(IdemError::UniqueConstraintUnexpected { table, message }) => {
            assert_eq!(table, "request_record");
            assert!(message.contains("audit.tag"));
        }
        other => panic!("unexpected classification {other:?}"),
    }
}
