use rusqlite::{params_from_iter, Connection};

use crate::batch::{field_to_sql, BatchData};
use crate::error::DbError;

/// SQLite's practical bound on bound parameters per statement, kept well
/// below `SQLITE_MAX_VARIABLE_NUMBER` (§4.2); matches the headroom used
/// elsewhere in the core (delete chunking in `sync-apply`).
pub const MAX_BOUND_PARAMS: usize = 900;

/// Converts accumulated batches into the smallest number of multi-row
/// `INSERT OR IGNORE` statements, reusing prepared statements across calls
/// for full-size chunks.
///
/// Rather than own a hand-rolled cache of `Statement<'conn>` (which is
/// self-referential and awkward in Rust), the helper leans on
/// `Connection::prepare_cached`: the SQL text itself already encodes the
/// cache key `(table, column signature, rows-per-chunk)`, so two calls that
/// share a signature produce byte-identical SQL and therefore the same
/// cache slot. Short, partial-size chunks are prepared with
/// `Connection::prepare` (uncached) and dropped immediately after
/// `execute`, finalizing them without polluting the cache.
pub struct SqliteInsertHelper;

impl SqliteInsertHelper {
  pub fn new() -> Self {
    SqliteInsertHelper
  }

  /// Inserts every table in `batch`, in the table's `BTreeMap` (sorted)
  /// order.
  pub fn insert_batch(&self, conn: &Connection, batch: &BatchData) -> Result<(), DbError> {
    for (table, table_batch) in &batch.tables {
      if table_batch.rows.is_empty() {
        continue;
      }
      self.insert_rows_multi(conn, table, &table_batch.columns, &table_batch.rows)?;
    }
    Ok(())
  }

  pub fn insert_rows_multi(
    &self,
    conn: &Connection,
    table: &str,
    columns: &[String],
    rows: &[Vec<slice_wire::FieldValue>],
  ) -> Result<(), DbError> {
    let column_count = columns.len().max(1);
    let rows_per_chunk = (MAX_BOUND_PARAMS / column_count).max(1);

    for chunk in rows.chunks(rows_per_chunk) {
      let sql = build_insert_sql(table, columns, chunk.len());
      let params: Vec<rusqlite::types::Value> =
        chunk.iter().flat_map(|row| row.iter().map(field_to_sql)).collect();

      if chunk.len() == rows_per_chunk {
        log::debug!(
          "insert cache signature {}|{}|{}",
          table,
          columns.join(","),
          rows_per_chunk
        );
        let mut stmt = conn
          .prepare_cached(&sql)
          .map_err(|e| DbError::DbInsert(format!("prepare failed for {table}: {e}")))?;
        stmt
          .execute(params_from_iter(params.iter()))
          .map_err(|e| DbError::DbInsert(format!("insert failed for {table}: {e}")))?;
      } else {
        let mut stmt = conn
          .prepare(&sql)
          .map_err(|e| DbError::DbInsert(format!("prepare failed for {table}: {e}")))?;
        stmt
          .execute(params_from_iter(params.iter()))
          .map_err(|e| DbError::DbInsert(format!("insert failed for {table}: {e}")))?;
        // `stmt` drops (and finalizes) here, at the end of this match arm.
      }
    }
    Ok(())
  }

  /// Finalizes every cached prepared statement. Must be called before
  /// `COMMIT` or as part of rollback cleanup.
  pub fn finalize_statements(&self, conn: &Connection) {
    conn.flush_prepared_statement_cache();
  }
}

impl Default for SqliteInsertHelper {
  fn default() -> Self {
    Self::new()
  }
}

fn build_insert_sql(table: &str, columns: &[String], row_count: usize) -> String {
  let cols = columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(",");
  let placeholders = std::iter::repeat("?").take(columns.len()).collect::<Vec<_>>().join(",");
  let one_row = format!("({placeholders},'synced')");
  let values = std::iter::repeat(one_row).take(row_count).collect::<Vec<_>>().join(",");
  format!("INSERT OR IGNORE INTO \"{table}\"({cols},\"_status\") VALUES {values}")
}

#[cfg(test)]
mod tests {
  use super::*;
  use slice_wire::FieldValue;

  fn setup() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch("CREATE TABLE tasks (id TEXT PRIMARY KEY, name TEXT, _status TEXT);")
      .unwrap();
    conn
  }

  #[test]
  fn inserts_rows_and_stamps_synced_status() {
    let conn = setup();
    let helper = SqliteInsertHelper::new();
    let columns = vec!["id".to_string(), "name".to_string()];
    let rows = vec![
      vec![FieldValue::Text("t1".into()), FieldValue::Text("Alpha".into())],
      vec![FieldValue::Text("t2".into()), FieldValue::Null],
    ];
    helper.insert_rows_multi(&conn, "tasks", &columns, &rows).unwrap();

    let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks WHERE _status = 'synced'", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 2);
  }

  #[test]
  fn chunk_boundary_matches_floor_900_over_column_count() {
    let conn = setup();
    let helper = SqliteInsertHelper::new();
    let columns = vec!["id".to_string(), "name".to_string()];
    let rows_per_chunk = MAX_BOUND_PARAMS / columns.len();
    let rows: Vec<_> = (0..rows_per_chunk)
      .map(|i| vec![FieldValue::Text(format!("id{i}")), FieldValue::Text("x".into())])
      .collect();
    helper.insert_rows_multi(&conn, "tasks", &columns, &rows).unwrap();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0)).unwrap();
    assert_eq!(count as usize, rows_per_chunk);
  }

  #[test]
  fn insert_or_ignore_skips_duplicate_primary_keys() {
    let conn = setup();
    let helper = SqliteInsertHelper::new();
    let columns = vec!["id".to_string(), "name".to_string()];
    let rows = vec![vec![FieldValue::Text("dup".into()), FieldValue::Text("first".into())]];
    helper.insert_rows_multi(&conn, "tasks", &columns, &rows).unwrap();
    let rows2 = vec![vec![FieldValue::Text("dup".into()), FieldValue::Text("second".into())]];
    helper.insert_rows_multi(&conn, "tasks", &columns, &rows2).unwrap();

    let name: String = conn.query_row("SELECT name FROM tasks WHERE id='dup'", [], |r| r.get(0)).unwrap();
    assert_eq!(name, "first");
  }

  #[test]
  fn finalize_clears_prepared_statement_cache() {
    let conn = setup();
    let helper = SqliteInsertHelper::new();
    let columns = vec!["id".to_string(), "name".to_string()];
    let rows_per_chunk = MAX_BOUND_PARAMS / columns.len();
    let rows: Vec<_> = (0..rows_per_chunk)
      .map(|i| vec![FieldValue::Text(format!("id{i}")), FieldValue::Text("x".into())])
      .collect();
    helper.insert_rows_multi(&conn, "tasks", &columns, &rows).unwrap();
    // flush_prepared_statement_cache() must not panic even when the cache
    // holds entries from a full-size chunk insert above.
    helper.finalize_statements(&conn);
  }
}
