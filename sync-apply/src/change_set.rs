use serde_json::{Map, Value};

use crate::error::ApplyError;

const TABLE_KEYS: &[&str] = &["table", "tableName"];
const ROW_KEYS: &[&str] = &["row", "record", "data"];
const SEQUENCE_KEYS: &[&str] = &["sequenceId", "sequence_id", "sequence"];
const DELETE_FLAG_KEYS: &[&str] = &["deleted", "isDeleted", "is_deleted"];
const TYPE_KEYS: &[&str] = &["type", "op", "operation"];
const DELETE_TYPE_VALUES: &[&str] = &["delete", "deleted"];

/// One decoded pull-response entry, after resolving every documented
/// synonym for `table`, the delete flag, `sequenceId`, and the row payload
/// (§3, §4.5). Canonical field names on *write* are `table`, `deleted`,
/// `sequenceId`, `row` (§3 supplement); all are still accepted on read.
pub struct ChangeEntry {
  pub table: String,
  pub deleted: bool,
  pub sequence_id: Option<String>,
  pub row: Map<String, Value>,
}

pub fn parse_entries(payload: &str) -> Result<Vec<ChangeEntry>, ApplyError> {
  let root: Value = serde_json::from_str(payload)?;
  let array = root.as_array().ok_or(ApplyError::NotAnArray)?;
  array.iter().map(parse_entry).collect()
}

fn parse_entry(value: &Value) -> Result<ChangeEntry, ApplyError> {
  let obj = value.as_object().ok_or(ApplyError::NotAnArray)?;

  let table = find_str(obj, TABLE_KEYS).ok_or(ApplyError::MissingTable)?;
  let deleted = extract_deleted(obj);
  let sequence_id = extract_sequence_id(obj);
  let row = extract_row(obj);

  Ok(ChangeEntry { table, deleted, sequence_id, row })
}

fn find_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
  keys.iter().find_map(|k| obj.get(*k)).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn extract_deleted(obj: &Map<String, Value>) -> bool {
  if DELETE_FLAG_KEYS.iter().any(|k| obj.get(*k).and_then(Value::as_bool) == Some(true)) {
    return true;
  }
  if let Some(type_value) = TYPE_KEYS.iter().find_map(|k| obj.get(*k)).and_then(Value::as_str) {
    return DELETE_TYPE_VALUES.iter().any(|v| v.eq_ignore_ascii_case(type_value));
  }
  false
}

fn extract_sequence_id(obj: &Map<String, Value>) -> Option<String> {
  let value = SEQUENCE_KEYS.iter().find_map(|k| obj.get(*k))?;
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn extract_row(obj: &Map<String, Value>) -> Map<String, Value> {
  if let Some(nested) = ROW_KEYS.iter().find_map(|k| obj.get(*k)).and_then(Value::as_object) {
    return nested.clone();
  }

  let mut reserved: Vec<&str> = Vec::new();
  reserved.extend_from_slice(TABLE_KEYS);
  reserved.extend_from_slice(ROW_KEYS);
  reserved.extend_from_slice(SEQUENCE_KEYS);
  reserved.extend_from_slice(DELETE_FLAG_KEYS);
  reserved.extend_from_slice(TYPE_KEYS);

  obj
    .iter()
    .filter(|(k, _)| !reserved.contains(&k.as_str()))
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect()
}

/// Lexicographic max of two optional sequence ids, per §3's watermark
/// invariant ("updated only ... to the lexicographically maximum
/// `sequenceId` seen").
pub fn lexicographic_max(a: Option<String>, b: Option<&str>) -> Option<String> {
  match (a, b) {
    (Some(a), Some(b)) => Some(if a.as_str() >= b { a } else { b.to_string() }),
    (Some(a), None) => Some(a),
    (None, Some(b)) => Some(b.to_string()),
    (None, None) => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_all_documented_synonyms() {
    let payload = r#"[
      {"tableName":"tasks","isDeleted":false,"sequence_id":42,"data":{"id":"t1","name":"A"}},
      {"table":"tasks","type":"delete","sequence":"01ARZ","id":"t2"}
    ]"#;
    let entries = parse_entries(payload).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].table, "tasks");
    assert!(!entries[0].deleted);
    assert_eq!(entries[0].sequence_id.as_deref(), Some("42"));
    assert_eq!(entries[0].row.get("id").and_then(Value::as_str), Some("t1"));

    assert!(entries[1].deleted);
    assert_eq!(entries[1].sequence_id.as_deref(), Some("01ARZ"));
    assert_eq!(entries[1].row.get("id").and_then(Value::as_str), Some("t2"));
  }

  #[test]
  fn missing_table_is_an_error() {
    let payload = r#"[{"row":{"id":"t1"}}]"#;
    assert!(matches!(parse_entries(payload), Err(ApplyError::MissingTable)));
  }

  #[test]
  fn lexicographic_max_prefers_greater_string() {
    assert_eq!(lexicographic_max(Some("A".into()), Some("B")).as_deref(), Some("B"));
    assert_eq!(lexicographic_max(Some("B".into()), Some("A")).as_deref(), Some("B"));
    assert_eq!(lexicographic_max(None, Some("A")).as_deref(), Some("A"));
  }
}
