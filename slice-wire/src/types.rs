/// Header that opens every slice stream (§3 Data model: the exact wire
/// shape).
#[derive(Debug, Clone, PartialEq)]
pub struct SliceHeader {
  pub slice_id: String,
  pub version: i64,
  pub priority: String,
  pub timestamp: i64,
  pub number_of_tables: i64,
}

/// Header that opens every table section within a slice.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHeader {
  pub table_name: String,
  pub columns: Vec<String>,
}

/// A single decoded column value. `Null` is produced both for an explicit
/// `typeTag == 0` and for any field whose declared `fieldSize` is zero,
/// regardless of tag (per §3).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
  Null,
  Int(i64),
  Real(f64),
  Text(String),
  Blob(Vec<u8>),
}

/// One decoded row, positionally aligned with the owning `TableHeader`'s
/// `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
  pub values: Vec<FieldValue>,
}
