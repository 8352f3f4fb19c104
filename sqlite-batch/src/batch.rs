use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use slice_wire::FieldValue;

/// Rows accumulated for a single destination table, sharing one column list
/// (§3: columns are cached on the first row of a table within a batch).
#[derive(Debug, Default, Clone)]
pub struct TableBatch {
  pub columns: Vec<String>,
  pub rows: Vec<Vec<FieldValue>>,
}

impl TableBatch {
  pub fn row_count(&self) -> usize {
    self.rows.len()
  }
}

/// A batch of rows destined for zero or more tables, as accumulated by
/// `SliceImportEngine` between flushes. Stored in a `BTreeMap` so
/// `SqliteInsertHelper::insert_batch` can iterate tables in sorted order for
/// deterministic behavior (§4.2).
#[derive(Debug, Default, Clone)]
pub struct BatchData {
  pub tables: BTreeMap<String, TableBatch>,
}

impl BatchData {
  pub fn new() -> Self {
    BatchData::default()
  }

  pub fn is_empty(&self) -> bool {
    self.tables.values().all(|t| t.rows.is_empty())
  }

  pub fn total_rows(&self) -> usize {
    self.tables.values().map(|t| t.rows.len()).sum()
  }

  /// Appends one row to `table`, adopting `columns` the first time the
  /// table is seen within this batch.
  pub fn push_row(&mut self, table: &str, columns: &[String], values: Vec<FieldValue>) {
    let entry = self.tables.entry(table.to_string()).or_insert_with(|| TableBatch {
      columns: columns.to_vec(),
      rows: Vec::new(),
    });
    entry.rows.push(values);
  }

  pub fn clear(&mut self) {
    self.tables.clear();
  }
}

pub fn field_to_sql(value: &FieldValue) -> SqlValue {
  match value {
    FieldValue::Null => SqlValue::Null,
    FieldValue::Int(i) => SqlValue::Integer(*i),
    FieldValue::Real(r) => SqlValue::Real(*r),
    FieldValue::Text(s) => SqlValue::Text(s.clone()),
    FieldValue::Blob(b) => SqlValue::Blob(b.clone()),
  }
}
