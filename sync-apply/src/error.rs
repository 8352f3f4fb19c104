use thiserror::Error;

use sqlite_batch::DbError;

/// Abstract error kinds for `apply()`, matching §7's `Apply` / `TxBegin` /
/// `TxCommit` / `DbInsert` kinds.
#[derive(Debug, Error)]
pub enum ApplyError {
  #[error("payload is not a JSON array of change entries")]
  NotAnArray,
  #[error("malformed change-set JSON: {0}")]
  Json(String),
  #[error("BEGIN failed: {0}")]
  TxBegin(String),
  #[error("COMMIT failed: {0}")]
  TxCommit(String),
  #[error("insert failed: {0}")]
  DbInsert(String),
  #[error("change entry is missing a table name")]
  MissingTable,
  #[error("change entry for table {0:?} has no extractable id")]
  MissingId(String),
  #[error("table {0:?} has no \"id\" column")]
  SchemaMismatch(String),
}

impl ApplyError {
  pub fn message(&self) -> String {
    self.to_string()
  }
}

impl From<serde_json::Error> for ApplyError {
  fn from(e: serde_json::Error) -> Self {
    ApplyError::Json(e.to_string())
  }
}

impl From<DbError> for ApplyError {
  fn from(e: DbError) -> Self {
    match e {
      DbError::TxBegin(m) => ApplyError::TxBegin(m),
      DbError::TxCommit(m) => ApplyError::TxCommit(m),
      DbError::DbInsert(m) => ApplyError::DbInsert(m),
      DbError::Savepoint(m) => ApplyError::DbInsert(m),
      DbError::Sqlite(e) => ApplyError::DbInsert(e.to_string()),
    }
  }
}
