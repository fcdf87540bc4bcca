//! Table creation and verification
//!
//! Schema management normally belongs to migrations; these helpers exist for
//! tests, the demo runner and deployments that let the service own its tables.

use idemlock_common::{IdemError, Result};
use sea_orm::sea_query::{Alias, ColumnDef, IntoIden, Query, Table};
use sea_orm::{ConnectionTrait, DbBackend, DbErr, Statement};

use crate::model::{LockColumn, RecordColumn};

/// Create the idempotency table if it does not exist.
///
/// One layout serves both coordinators: `version` defaults to 1 and
/// `locked_until` stays NULL for embedded inserts.
pub async fn create_idempotency_table<C: ConnectionTrait>(conn: &C, table: &str) -> Result<()> {
    let backend = conn.get_database_backend();
    let stmt = Table::create()
        .table(Alias::new(table))
        .if_not_exists()
        .col(
            ColumnDef::new(RecordColumn::Id)
                .string_len(255)
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(RecordColumn::Result).blob().null())
        .col(timestamp_column(backend, RecordColumn::CreatedAt).not_null())
        .col(timestamp_column(backend, RecordColumn::UpdatedAt).not_null())
        .col(
            ColumnDef::new(RecordColumn::Version)
                .big_integer()
                .not_null()
                .default(1),
        )
        .col(timestamp_column(backend, RecordColumn::LockedUntil).null())
        .to_owned();
    conn.execute(backend.build(&stmt)).await?;
    tracing::info!(table, "Idempotency table ready");
    Ok(())
}

/// Create the named lock table if it does not exist.
pub async fn create_lock_table<C: ConnectionTrait>(conn: &C, table: &str) -> Result<()> {
    let backend = conn.get_database_backend();
    let stmt = Table::create()
        .table(Alias::new(table))
        .if_not_exists()
        .col(
            ColumnDef::new(LockColumn::Name)
                .string_len(255)
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(LockColumn::Version).big_integer().not_null())
        .col(timestamp_column(backend, LockColumn::ExpiresAt).not_null())
        .to_owned();
    conn.execute(backend.build(&stmt)).await?;
    tracing::info!(table, "Lock table ready");
    Ok(())
}

/// Timestamp column holding microseconds. MySQL's `TIMESTAMP` keeps whole
/// seconds and ends in 2038, so it gets `DATETIME(6)` instead.
fn timestamp_column<T: IntoIden>(backend: DbBackend, column: T) -> ColumnDef {
    let mut def = ColumnDef::new(column);
    match backend {
        DbBackend::MySql => def.custom(Alias::new("DATETIME(6)")),
        _ => def.timestamp_with_time_zone(),
    };
    def
}

/// Check that `table` exists with the columns the services read.
///
/// PostgreSQL and MySQL reject a probe select naming a missing column.
/// SQLite reads an unknown double-quoted identifier as a string literal, so
/// there the columns are looked up in `pragma_table_info`.
pub async fn verify_table<C: ConnectionTrait>(conn: &C, table: &str, columns: &[&str]) -> Result<()> {
    if conn.get_database_backend() == DbBackend::Sqlite {
        return verify_sqlite_table(conn, table, columns).await;
    }

    let stmt = Query::select()
        .columns(columns.iter().map(|c| Alias::new(*c)))
        .from(Alias::new(table))
        .limit(1)
        .to_owned();
    conn.query_all(conn.get_database_backend().build(&stmt)).await?;
    Ok(())
}

async fn verify_sqlite_table<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    columns: &[&str],
) -> Result<()> {
    let rows = conn
        .query_all(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT name FROM pragma_table_info(?)",
            [table.into()],
        ))
        .await?;
    let present = rows
        .iter()
        .map(|row| row.try_get::<String>("", "name"))
        .collect::<std::result::Result<Vec<_>, DbErr>>()?;

    if present.is_empty() {
        return Err(IdemError::Storage(DbErr::Custom(format!(
            "table '{}' does not exist",
            table
        ))));
    }

    let missing: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|column| !present.iter().any(|name| name.eq_ignore_ascii_case(column)))
        .collect();
    if !missing.is_empty() {
        return Err(IdemError::Storage(DbErr::Custom(format!(
            "table '{}' is missing column(s): {}",
            table,
            missing.join(", ")
        ))));
    }
    Ok(())
}

pub const IDEMPOTENCY_COLUMNS: [&str; 6] = [
    "id",
    "result",
    "created_at",
    "updated_at",
    "version",
    "locked_until",
];

pub const LOCK_COLUMNS: [&str; 3] = ["name", "version", "expires_at"];

#[cfg(test)]
mod tests {
    use super::*;

    fn created_at_sql(backend: DbBackend) -> String {
        let stmt = Table::create()
            .table(Alias::new("request_record"))
            .col(timestamp_column(backend, RecordColumn::CreatedAt).not_null())
            .to_owned();
        backend.build(&stmt).sql
    }

    #[test]
    fn test_mysql_timestamps_keep_microseconds() {
        assert!(created_at_sql(DbBackend::MySql).contains("DATETIME(6)"));
        assert!(created_at_sql(DbBackend::Postgres).contains("timestamp with time zone"));
    }
}
