use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use sqlite_batch::DatabaseInterface;

use crate::change_set::{lexicographic_max, parse_entries};
use crate::error::ApplyError;
use crate::schema::SchemaCache;

/// Local-storage key watermarking the highest applied sequence id (§3).
pub const LAST_SEQUENCE_ID_KEY: &str = "__watermelon_last_sequence_id";
/// Same parameter-count ceiling the insert helper uses (§4.5).
const MAX_DELETE_PARAMS: usize = 900;

/// Converts a pull-response JSON payload into idempotent SQL mutations
/// inside a single transaction: per-row upserts, batched deletes, and a
/// monotonic sequence-id watermark write (§4.5).
pub struct SyncApplyEngine {
  schema_cache: SchemaCache,
}

impl SyncApplyEngine {
  pub fn new() -> Self {
    SyncApplyEngine { schema_cache: SchemaCache::new() }
  }

  pub fn apply(&mut self, db: &dyn DatabaseInterface, payload_json: &str) -> Result<(), ApplyError> {
    let entries = parse_entries(payload_json)?;

    db.begin_transaction()?;
    let result = self.apply_within_transaction(db, entries);
    match result {
      Ok(()) => {
        db.commit_transaction()?;
        Ok(())
      }
      Err(e) => {
        db.rollback_transaction();
        Err(e)
      }
    }
  }

  fn apply_within_transaction(
    &mut self,
    db: &dyn DatabaseInterface,
    entries: Vec<crate::change_set::ChangeEntry>,
  ) -> Result<(), ApplyError> {
    let mut deletes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut max_sequence_id: Option<String> = None;

    for entry in entries {
      max_sequence_id = lexicographic_max(max_sequence_id, entry.sequence_id.as_deref());

      if entry.deleted {
        let id = entry
          .row
          .get("id")
          .and_then(Value::as_str)
          .ok_or_else(|| ApplyError::MissingId(entry.table.clone()))?;
        deletes.entry(entry.table).or_default().push(id.to_string());
      } else {
        let mut outcome = Ok(());
        db.with_connection(&mut |conn| {
          outcome = self.apply_row_object(conn, &entry.table, &entry.row);
          Ok(())
        })?;
        outcome?;
      }
    }

    for (table, ids) in &deletes {
      let mut outcome = Ok(());
      db.with_connection(&mut |conn| {
        outcome = delete_rows(conn, table, ids);
        Ok(())
      })?;
      outcome?;
    }

    if let Some(sequence_id) = max_sequence_id {
      let mut outcome = Ok(());
      db.with_connection(&mut |conn| {
        outcome = (|| {
          let stored = read_watermark(conn)?;
          let next = lexicographic_max(stored, Some(sequence_id.as_str())).expect("always Some when a side is Some");
          write_watermark(conn, &next)
        })();
        Ok(())
      })?;
      outcome?;
    }

    Ok(())
  }

  /// Validates `row`'s keys against the cached schema, drops anything
  /// still unrecognized after one reload, requires an `id` column, and
  /// issues `INSERT OR REPLACE` with columns sorted for a stable SQL shape
  /// (§4.5).
  fn apply_row_object(
    &mut self,
    conn: &Connection,
    table: &str,
    row: &serde_json::Map<String, Value>,
  ) -> Result<(), ApplyError> {
    if row.get("id").and_then(Value::as_str).is_none() {
      return Err(ApplyError::MissingId(table.to_string()));
    }

    let mut known = self.schema_cache.filter_known_columns(conn, table, row.keys())?;
    if !known.iter().any(|c| c == "id") {
      return Err(ApplyError::SchemaMismatch(table.to_string()));
    }
    known.sort();

    let columns = known.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(",");
    let placeholders = std::iter::repeat("?").take(known.len()).collect::<Vec<_>>().join(",");
    let sql = format!("INSERT OR REPLACE INTO \"{table}\"({columns}) VALUES ({placeholders})");

    let params: Vec<SqlValue> = known.iter().map(|c| json_to_sql(row.get(c).unwrap_or(&Value::Null))).collect();
    conn
      .execute(&sql, rusqlite::params_from_iter(params.iter()))
      .map_err(|e| ApplyError::DbInsert(format!("upsert into {table} failed: {e}")))?;
    Ok(())
  }
}

impl Default for SyncApplyEngine {
  fn default() -> Self {
    Self::new()
  }
}

fn delete_rows(conn: &Connection, table: &str, ids: &[String]) -> Result<(), ApplyError> {
  for chunk in ids.chunks(MAX_DELETE_PARAMS) {
    let placeholders = std::iter::repeat("?").take(chunk.len()).collect::<Vec<_>>().join(",");
    let sql = format!("DELETE FROM \"{table}\" WHERE id IN ({placeholders})");
    conn
      .execute(&sql, rusqlite::params_from_iter(chunk.iter()))
      .map_err(|e| ApplyError::DbInsert(format!("delete from {table} failed: {e}")))?;
  }
  Ok(())
}

/// Reads the currently persisted watermark, if any (§3: the watermark is
/// never written with a value lexicographically smaller than the current
/// one, so a write must read-then-max rather than overwrite blindly).
fn read_watermark(conn: &Connection) -> Result<Option<String>, ApplyError> {
  conn
    .query_row(
      "SELECT value FROM local_storage WHERE key = ?",
      rusqlite::params![LAST_SEQUENCE_ID_KEY],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| ApplyError::DbInsert(format!("watermark read failed: {e}")))
}

fn write_watermark(conn: &Connection, sequence_id: &str) -> Result<(), ApplyError> {
  conn
    .execute(
      "INSERT OR REPLACE INTO local_storage(key, value) VALUES (?, ?)",
      rusqlite::params![LAST_SEQUENCE_ID_KEY, sequence_id],
    )
    .map_err(|e| ApplyError::DbInsert(format!("watermark write failed: {e}")))?;
  Ok(())
}

fn json_to_sql(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
    Value::Number(n) => {
      if let Some(i) = n.as_i64() {
        SqlValue::Integer(i)
      } else {
        SqlValue::Real(n.as_f64().unwrap_or(0.0))
      }
    }
    Value::String(s) => SqlValue::Text(s.clone()),
    Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use rusqlite::Connection;
  use sqlite_batch::SqliteDatabase;

  use super::*;

  fn setup() -> Arc<SqliteDatabase> {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch(
        "CREATE TABLE tasks (id TEXT PRIMARY KEY, name TEXT, _status TEXT);
         CREATE TABLE local_storage (key TEXT PRIMARY KEY, value TEXT);",
      )
      .unwrap();
    Arc::new(SqliteDatabase::new(conn))
  }

  #[test]
  fn upserts_deletes_and_writes_watermark() {
    let db = setup();
    let mut engine = SyncApplyEngine::new();
    let payload = r#"[
      {"table":"tasks","row":{"id":"t1","name":"A"},"sequenceId":"01ARZ...V"},
      {"table":"tasks","row":{"id":"t2","name":"B"},"sequenceId":"01ARZ...W"},
      {"table":"tasks","deleted":true,"id":"t1","sequenceId":"01ARZ...U"}
    ]"#;

    engine.apply(db.as_ref(), payload).unwrap();

    let mut names = Vec::new();
    db.with_connection(&mut |conn| {
      let mut stmt = conn.prepare("SELECT id, name FROM tasks ORDER BY id").unwrap();
      names = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
      Ok(())
    })
    .unwrap();
    assert_eq!(names, vec![("t2".to_string(), "B".to_string())]);

    let mut watermark = String::new();
    db.with_connection(&mut |conn| {
      watermark = conn
        .query_row(
          "SELECT value FROM local_storage WHERE key = ?",
          [LAST_SEQUENCE_ID_KEY],
          |r| r.get(0),
        )
        .unwrap();
      Ok(())
    })
    .unwrap();
    assert_eq!(watermark, "01ARZ...W");
  }

  #[test]
  fn apply_is_idempotent() {
    let db = setup();
    let mut engine = SyncApplyEngine::new();
    let payload = r#"[{"table":"tasks","row":{"id":"t1","name":"A"},"sequenceId":"1"}]"#;
    engine.apply(db.as_ref(), payload).unwrap();
    engine.apply(db.as_ref(), payload).unwrap();

    let mut count = 0i64;
    db.with_connection(&mut |conn| {
      count = conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0)).unwrap();
      Ok(())
    })
    .unwrap();
    assert_eq!(count, 1);
  }

  #[test]
  fn unknown_columns_are_dropped_not_fatal() {
    let db = setup();
    let mut engine = SyncApplyEngine::new();
    let payload = r#"[{"table":"tasks","row":{"id":"t1","name":"A","bogus_column":"x"}}]"#;
    engine.apply(db.as_ref(), payload).unwrap();
  }

  #[test]
  fn watermark_never_regresses_below_the_stored_value() {
    let db = setup();
    let mut engine = SyncApplyEngine::new();
    engine
      .apply(db.as_ref(), r#"[{"table":"tasks","row":{"id":"t1","name":"A"},"sequenceId":"03"}]"#)
      .unwrap();
    // A later batch whose own max sequenceId sorts lower than what's already
    // stored (e.g. a replayed or out-of-order page) must not move the
    // watermark backwards.
    engine
      .apply(db.as_ref(), r#"[{"table":"tasks","row":{"id":"t2","name":"B"},"sequenceId":"01"}]"#)
      .unwrap();

    let mut watermark = String::new();
    db.with_connection(&mut |conn| {
      watermark = conn
        .query_row("SELECT value FROM local_storage WHERE key = ?", [LAST_SEQUENCE_ID_KEY], |r| r.get(0))
        .unwrap();
      Ok(())
    })
    .unwrap();
    assert_eq!(watermark, "03");
  }

  #[test]
  fn delete_without_id_fails_and_rolls_back() {
    let db = setup();
    let mut engine = SyncApplyEngine::new();
    let payload = r#"[
      {"table":"tasks","row":{"id":"t1","name":"A"}},
      {"table":"tasks","deleted":true}
    ]"#;
    let err = engine.apply(db.as_ref(), payload).unwrap_err();
    assert!(matches!(err, ApplyError::MissingId(_)));

    let mut count = 0i64;
    db.with_connection(&mut |conn| {
      count = conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0)).unwrap();
      Ok(())
    })
    .unwrap();
    assert_eq!(count, 0, "failed apply must leave the DB untouched");
  }
}
