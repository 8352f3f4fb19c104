use std::collections::{HashMap, HashSet};

use rusqlite::Connection;

use crate::error::ApplyError;

/// A table's column set as of a given `PRAGMA schema_version` epoch.
pub struct CachedTableSchema {
  pub epoch: i64,
  pub columns: HashSet<String>,
}

/// Per-table column cache keyed by table name, invalidated against SQLite's
/// own `schema_version` counter so a migration elsewhere in the app is
/// picked up without the apply engine needing to know about it (§4.5).
#[derive(Default)]
pub struct SchemaCache {
  tables: HashMap<String, CachedTableSchema>,
}

impl SchemaCache {
  pub fn new() -> Self {
    SchemaCache::default()
  }

  fn schema_version(conn: &Connection) -> Result<i64, ApplyError> {
    conn
      .query_row("PRAGMA schema_version", [], |row| row.get(0))
      .map_err(|e| ApplyError::DbInsert(e.to_string()))
  }

  fn load_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, ApplyError> {
    let mut stmt = conn
      .prepare(&format!("PRAGMA table_info(\"{table}\")"))
      .map_err(|e| ApplyError::DbInsert(e.to_string()))?;
    let columns = stmt
      .query_map([], |row| row.get::<_, String>(1))
      .map_err(|e| ApplyError::DbInsert(e.to_string()))?
      .collect::<Result<HashSet<_>, _>>()
      .map_err(|e| ApplyError::DbInsert(e.to_string()))?;
    Ok(columns)
  }

  /// Ensures `table`'s columns are cached against the current schema
  /// epoch, loading them on first use.
  fn ensure_loaded(&mut self, conn: &Connection, table: &str) -> Result<(), ApplyError> {
    let epoch = Self::schema_version(conn)?;
    let needs_reload = match self.tables.get(table) {
      Some(cached) => cached.epoch != epoch,
      None => true,
    };
    if needs_reload {
      let columns = Self::load_columns(conn, table)?;
      self.tables.insert(table.to_string(), CachedTableSchema { epoch, columns });
    }
    Ok(())
  }

  /// Forces a reload of `table`'s columns regardless of the cached epoch,
  /// used once per unrecognized column per table per `apply()` call.
  fn reload(&mut self, conn: &Connection, table: &str) -> Result<(), ApplyError> {
    let epoch = Self::schema_version(conn)?;
    let columns = Self::load_columns(conn, table)?;
    self.tables.insert(table.to_string(), CachedTableSchema { epoch, columns });
    Ok(())
  }

  pub fn columns(&self, table: &str) -> Option<&HashSet<String>> {
    self.tables.get(table).map(|c| &c.columns)
  }

  /// Validates `keys` against the cached schema for `table`, reloading once
  /// if any key is unrecognized. Returns the set of keys that survive —
  /// anything still unknown after the reload is silently dropped (§4.5).
  pub fn filter_known_columns<'a>(
    &mut self,
    conn: &Connection,
    table: &str,
    keys: impl Iterator<Item = &'a String>,
  ) -> Result<Vec<String>, ApplyError> {
    self.ensure_loaded(conn, table)?;
    let keys: Vec<&String> = keys.collect();
    let has_unknown = keys.iter().any(|k| !self.columns(table).unwrap().contains(k.as_str()));
    if has_unknown {
      self.reload(conn, table)?;
    }
    let known = self.columns(table).unwrap();
    Ok(keys.into_iter().filter(|k| known.contains(k.as_str())).cloned().collect())
  }
}
