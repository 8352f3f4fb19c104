use thiserror::Error;

/// Error kinds that can arise from the local SQL engine boundary, matching
/// the core's abstract `TxBegin` / `TxCommit` / `DbInsert` kinds (§7).
#[derive(Debug, Error)]
pub enum DbError {
  #[error("BEGIN failed: {0}")]
  TxBegin(String),
  #[error("COMMIT failed: {0}")]
  TxCommit(String),
  #[error("insert failed: {0}")]
  DbInsert(String),
  #[error("savepoint operation failed: {0}")]
  Savepoint(String),
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
}

impl DbError {
  pub fn message(&self) -> String {
    self.to_string()
  }
}
