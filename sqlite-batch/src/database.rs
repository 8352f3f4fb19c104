use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::batch::BatchData;
use crate::error::DbError;
use crate::insert_helper::SqliteInsertHelper;

/// Tuning PRAGMAs applied for the duration of a slice import (§4.4).
const TUNING_PRAGMAS: &str = "
  PRAGMA journal_mode = WAL;
  PRAGMA synchronous = NORMAL;
  PRAGMA temp_store = MEMORY;
  PRAGMA cache_size = -20000;
  PRAGMA wal_autocheckpoint = 10000;
";

/// PRAGMAs restored once an import or sync transaction completes, returning
/// the connection to its conservative defaults.
const DEFAULT_PRAGMAS: &str = "
  PRAGMA synchronous = FULL;
  PRAGMA wal_autocheckpoint = 1000;
";

/// Abstract contract the core requires from the embedding platform's local
/// SQL engine (§4.3). Object-safe so both `SliceImportEngine` and
/// `SyncApplyEngine` can hold it as `Arc<dyn DatabaseInterface>`.
///
/// Implementations must serialize every call on a single database-affine
/// executor; `SqliteDatabase` realizes that with a `Mutex<Connection>` since
/// `rusqlite::Connection` is `Send` but not `Sync` — the mutex guard *is*
/// the executor boundary described in §5.
pub trait DatabaseInterface: Send + Sync {
  fn begin_transaction(&self) -> Result<(), DbError>;
  fn commit_transaction(&self) -> Result<(), DbError>;
  /// Best-effort: must succeed without raising, per §4.3.
  fn rollback_transaction(&self);
  fn insert_batch(&self, batch: &BatchData) -> Result<(), DbError>;
  fn create_savepoint(&self) -> Result<(), DbError>;
  fn release_savepoint(&self) -> Result<(), DbError>;
  fn apply_tuning_pragmas(&self) -> Result<(), DbError>;
  fn restore_default_pragmas(&self) -> Result<(), DbError>;
  fn wal_checkpoint_truncate(&self) -> Result<(), DbError>;
  /// Runs `f` with exclusive access to the underlying connection, for
  /// collaborators (namely `sync-apply`) that need arbitrary SQL beyond the
  /// batch-insert path: `PRAGMA table_info`, upserts, deletes, the
  /// `local_storage` watermark write.
  fn with_connection(&self, f: &mut dyn FnMut(&Connection) -> Result<(), DbError>) -> Result<(), DbError>;
}

pub struct SqliteDatabase {
  conn: Mutex<Connection>,
  helper: SqliteInsertHelper,
  open: Mutex<bool>,
}

impl SqliteDatabase {
  pub fn new(conn: Connection) -> Self {
    SqliteDatabase {
      conn: Mutex::new(conn),
      helper: SqliteInsertHelper::new(),
      open: Mutex::new(false),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().expect("sqlite connection mutex poisoned")
  }
}

impl DatabaseInterface for SqliteDatabase {
  fn begin_transaction(&self) -> Result<(), DbError> {
    let mut is_open = self.open.lock().unwrap();
    if *is_open {
      // Idempotent: a second begin while one is open is a no-op failure the
      // caller should treat as already-begun, not fatal (§4.3).
      return Ok(());
    }
    let conn = self.lock();
    conn
      .execute_batch("BEGIN IMMEDIATE;")
      .map_err(|e| DbError::TxBegin(e.to_string()))?;
    *is_open = true;
    Ok(())
  }

  fn commit_transaction(&self) -> Result<(), DbError> {
    let conn = self.lock();
    // Release any open savepoint first; ignore failure, there may be none.
    let _ = conn.execute_batch("RELEASE SAVEPOINT sp;");
    conn.execute_batch("COMMIT;").map_err(|e| DbError::TxCommit(e.to_string()))?;
    conn
      .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
      .map_err(|e| DbError::TxCommit(e.to_string()))?;
    conn.execute_batch(DEFAULT_PRAGMAS).map_err(|e| DbError::TxCommit(e.to_string()))?;
    self.helper.finalize_statements(&conn);
    drop(conn);
    *self.open.lock().unwrap() = false;
    Ok(())
  }

  fn rollback_transaction(&self) {
    let conn = self.lock();
    if conn.execute_batch("ROLLBACK TO SAVEPOINT sp; RELEASE SAVEPOINT sp;").is_err() {
      log::debug!("no savepoint sp to roll back to, falling through to ROLLBACK");
    }
    if let Err(e) = conn.execute_batch("ROLLBACK;") {
      log::warn!("rollback_transaction: ROLLBACK failed (database may already be clean): {e}");
    }
    self.helper.finalize_statements(&conn);
    drop(conn);
    *self.open.lock().unwrap() = false;
  }

  fn insert_batch(&self, batch: &BatchData) -> Result<(), DbError> {
    let conn = self.lock();
    self.helper.insert_batch(&conn, batch)
  }

  fn create_savepoint(&self) -> Result<(), DbError> {
    let conn = self.lock();
    conn.execute_batch("SAVEPOINT sp;").map_err(|e| DbError::Savepoint(e.to_string()))
  }

  fn release_savepoint(&self) -> Result<(), DbError> {
    let conn = self.lock();
    conn
      .execute_batch("RELEASE SAVEPOINT sp;")
      .map_err(|e| DbError::Savepoint(e.to_string()))
  }

  fn apply_tuning_pragmas(&self) -> Result<(), DbError> {
    let conn = self.lock();
    conn.execute_batch(TUNING_PRAGMAS).map_err(|e| DbError::TxBegin(e.to_string()))
  }

  fn restore_default_pragmas(&self) -> Result<(), DbError> {
    let conn = self.lock();
    conn.execute_batch(DEFAULT_PRAGMAS).map_err(|e| DbError::TxCommit(e.to_string()))
  }

  fn wal_checkpoint_truncate(&self) -> Result<(), DbError> {
    let conn = self.lock();
    conn
      .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
      .map_err(|e| DbError::TxCommit(e.to_string()))
  }

  fn with_connection(&self, f: &mut dyn FnMut(&Connection) -> Result<(), DbError>) -> Result<(), DbError> {
    let conn = self.lock();
    f(&conn)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn begin_commit_round_trip_leaves_transaction_closed() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY, _status TEXT);").unwrap();
    let db = SqliteDatabase::new(conn);
    db.begin_transaction().unwrap();
    db.create_savepoint().unwrap();
    db.release_savepoint().unwrap();
    db.commit_transaction().unwrap();
  }

  #[test]
  fn rollback_never_panics_even_without_open_transaction() {
    let conn = Connection::open_in_memory().unwrap();
    let db = SqliteDatabase::new(conn);
    db.rollback_transaction();
  }
}
