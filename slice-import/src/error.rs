use thiserror::Error;

use slice_wire::SliceWireError;
use sqlite_batch::DbError;

/// Abstract error kinds for one slice import, matching §7's table.
#[derive(Debug, Error)]
pub enum ImportError {
  #[error(transparent)]
  Wire(#[from] SliceWireError),
  #[error("BEGIN failed: {0}")]
  TxBegin(String),
  #[error("COMMIT failed: {0}")]
  TxCommit(String),
  #[error("insert failed: {0}")]
  DbInsert(String),
  #[error("a download transport error occurred: {0}")]
  Network(String),
  #[error("another import is already in flight")]
  Busy,
  #[error("Import cancelled")]
  Cancelled,
  #[error("Truncated slice data")]
  Truncated,
  #[error("Incomplete decompression")]
  IncompleteDecompression,
}

impl ImportError {
  pub fn message(&self) -> String {
    self.to_string()
  }
}

impl From<DbError> for ImportError {
  fn from(e: DbError) -> Self {
    match e {
      DbError::TxBegin(m) => ImportError::TxBegin(m),
      DbError::TxCommit(m) => ImportError::TxCommit(m),
      DbError::DbInsert(m) => ImportError::DbInsert(m),
      DbError::Savepoint(m) => ImportError::DbInsert(m),
      DbError::Sqlite(e) => ImportError::DbInsert(e.to_string()),
    }
  }
}
