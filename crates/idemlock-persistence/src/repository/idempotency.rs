//! Idempotency record statements
//!
//! Every mutation of an existing row is guarded by `result IS NULL`, which
//! keeps completed records terminal. The versioned variants additionally
//! compare the version the caller read.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, Query, SimpleExpr};
use sea_orm::{ConnectionTrait, DbErr, FromQueryResult};

use crate::model::{IdempotencyRecord, RecordColumn};

use super::build_error;

/// Insert for embedded mode: `version` keeps its column default, no lease.
pub async fn insert_unleased<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: &str,
    now: DateTime<Utc>,
) -> Result<(), DbErr> {
    let stmt = Query::insert()
        .into_table(Alias::new(table))
        .columns([RecordColumn::Id, RecordColumn::CreatedAt, RecordColumn::UpdatedAt])
        .values([id.into(), now.into(), now.into()])
        .map_err(build_error)?
        .to_owned();
    conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(())
}

/// Insert carrying version and lease, used by the standalone coordinator.
pub async fn insert_leased<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    record: &IdempotencyRecord,
) -> Result<(), DbErr> {
    let stmt = Query::insert()
        .into_table(Alias::new(table))
        .columns([
            RecordColumn::Id,
            RecordColumn::CreatedAt,
            RecordColumn::UpdatedAt,
            RecordColumn::Version,
            RecordColumn::LockedUntil,
        ])
        .values([
            record.id.as_str().into(),
            record.created_at.into(),
            record.updated_at.into(),
            record.version.into(),
            record.locked_until.into(),
        ])
        .map_err(build_error)?
        .to_owned();
    conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(())
}

pub async fn find<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: &str,
) -> Result<Option<IdempotencyRecord>, DbErr> {
    let stmt = Query::select()
        .columns(RecordColumn::ALL)
        .from(Alias::new(table))
        .and_where(Expr::col(RecordColumn::Id).eq(id))
        .to_owned();
    IdempotencyRecord::find_by_statement(conn.get_database_backend().build(&stmt))
        .one(conn)
        .await
}

/// Store the result of an unversioned record. Returns rows affected.
pub async fn complete_unversioned<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: &str,
    result: Vec<u8>,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let stmt = Query::update()
        .table(Alias::new(table))
        .value(RecordColumn::Result, result)
        .value(RecordColumn::UpdatedAt, now)
        .and_where(Expr::col(RecordColumn::Id).eq(id))
        .and_where(Expr::col(RecordColumn::Result).is_null())
        .to_owned();
    let res = conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(res.rows_affected())
}

/// Take over a reclaimable record with a fresh lease.
pub async fn claim<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: &str,
    expected_version: i64,
    locked_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    versioned_update(
        conn,
        table,
        id,
        expected_version,
        vec![
            (RecordColumn::LockedUntil, Some(locked_until).into()),
            (RecordColumn::UpdatedAt, now.into()),
        ],
    )
    .await
}

/// Store the result and drop the lease in one CAS step.
pub async fn complete<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: &str,
    expected_version: i64,
    result: Vec<u8>,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    versioned_update(
        conn,
        table,
        id,
        expected_version,
        vec![
            (RecordColumn::Result, result.into()),
            (RecordColumn::LockedUntil, Option::<DateTime<Utc>>::None.into()),
            (RecordColumn::UpdatedAt, now.into()),
        ],
    )
    .await
}

/// Drop the lease without a result, leaving the record reclaimable.
pub async fn unlock<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: &str,
    expected_version: i64,
    now: DateTime<Utc>,
) -> Result<u64, DbErr> {
    versioned_update(
        conn,
        table,
        id,
        expected_version,
        vec![
            (RecordColumn::LockedUntil, Option::<DateTime<Utc>>::None.into()),
            (RecordColumn::UpdatedAt, now.into()),
        ],
    )
    .await
}

async fn versioned_update<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: &str,
    expected_version: i64,
    values: Vec<(RecordColumn, SimpleExpr)>,
) -> Result<u64, DbErr> {
    let stmt = Query::update()
        .table(Alias::new(table))
        .values(values)
        .value(RecordColumn::Version, expected_version + 1)
        .and_where(Expr::col(RecordColumn::Id).eq(id))
        .and_where(Expr::col(RecordColumn::Version).eq(expected_version))
        .and_where(Expr::col(RecordColumn::Result).is_null())
        .to_owned();
    let res = conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(res.rows_affected())
}
