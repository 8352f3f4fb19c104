//! Bulk-insert and transaction-lifecycle layer over a local SQLite
//! connection: the `SqliteInsertHelper` (chunked, cached multi-row inserts)
//! and the `DatabaseInterface` contract the rest of the core programs
//! against.

mod batch;
mod database;
mod error;
mod insert_helper;

pub use batch::{field_to_sql, BatchData, TableBatch};
pub use database::{DatabaseInterface, SqliteDatabase};
pub use error::DbError;
pub use insert_helper::{SqliteInsertHelper, MAX_BOUND_PARAMS};
