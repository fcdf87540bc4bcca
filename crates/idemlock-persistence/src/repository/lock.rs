//! Named lock statements

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Alias, Expr, Query};
use sea_orm::{ConnectionTrait, DbErr, FromQueryResult};

use crate::model::{LockColumn, LockRecord};

use super::build_error;

pub async fn insert<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    lock: &LockRecord,
) -> Result<(), DbErr> {
    let stmt = Query::insert()
        .into_table(Alias::new(table))
        .columns(LockColumn::ALL)
        .values([
            lock.name.as_str().into(),
            lock.version.into(),
            lock.expires_at.into(),
        ])
        .map_err(build_error)?
        .to_owned();
    conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(())
}

pub async fn find<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    name: &str,
) -> Result<Option<LockRecord>, DbErr> {
    let stmt = Query::select()
        .columns(LockColumn::ALL)
        .from(Alias::new(table))
        .and_where(Expr::col(LockColumn::Name).eq(name))
        .to_owned();
    LockRecord::find_by_statement(conn.get_database_backend().build(&stmt))
        .one(conn)
        .await
}

/// Move the lock to `expected_version + 1` with a new expiry, only if nobody
/// else moved it first. Claim, renewal and release all go through here.
pub async fn compare_and_set<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    name: &str,
    expected_version: i64,
    expires_at: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let stmt = Query::update()
        .table(Alias::new(table))
        .value(LockColumn::Version, expected_version + 1)
        .value(LockColumn::ExpiresAt, expires_at)
        .and_where(Expr::col(LockColumn::Name).eq(name))
        .and_where(Expr::col(LockColumn::Version).eq(expected_version))
        .to_owned();
    let res = conn.execute(conn.get_database_backend().build(&stmt)).await?;
    Ok(res.rows_affected())
}
