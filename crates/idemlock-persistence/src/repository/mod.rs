//! Row-level statements for the managed tables
//!
//! Functions are generic over `ConnectionTrait`, so the same statement runs on
//! a pooled connection, an open transaction or a savepoint. They return raw
//! `DbErr` so callers can classify constraint violations themselves.

pub mod idempotency;
pub mod lock;

use sea_orm::DbErr;
use sea_orm::sea_query::error::Error as QueryBuildError;

fn build_error(err: QueryBuildError) -> DbErr {
    DbErr::Custom(format!("failed to build statement: {}", err))
}
