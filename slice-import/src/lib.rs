//! Orchestrates one slice bulk-import end-to-end: download, decode, batch,
//! flush, and savepoint-cycle inside a single long transaction (§4.4).

mod engine;
mod error;
mod platform;

pub use engine::{SliceImportEngine, COMPACT_EVERY_N_CHUNKS, SAVEPOINT_INTERVAL};
pub use error::ImportError;
pub use platform::{BoxStream, MemoryPressure, Platform, ReqwestPlatform, DEFAULT_MAX_BATCH_SIZE};

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  use bytes::Bytes;
  use rusqlite::Connection;

  use sqlite_batch::SqliteDatabase;

  use super::*;
  use crate::platform::BoxStream;

  fn encode_varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
      let mut byte = (v & 0x7F) as u8;
      v >>= 7;
      if v != 0 {
        byte |= 0x80;
      }
      out.push(byte);
      if v == 0 {
        break;
      }
    }
  }

  fn encode_string(s: &str, out: &mut Vec<u8>) {
    encode_varint(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
  }

  fn build_single_row_slice() -> Vec<u8> {
    let mut raw = Vec::new();
    encode_string("s1", &mut raw);
    encode_varint(1, &mut raw);
    encode_string("high", &mut raw);
    encode_varint(0, &mut raw);
    encode_varint(1, &mut raw);

    encode_string("tasks", &mut raw);
    encode_varint(2, &mut raw);
    encode_string("id", &mut raw);
    encode_string("name", &mut raw);

    encode_string("t1", &mut raw);
    raw.push(3);
    encode_string("Alpha", &mut raw);
    raw.push(3);
    raw.push(0xFF);

    zstd::stream::encode_all(raw.as_slice(), 0).unwrap()
  }

  struct FakePlatform {
    chunks: std::sync::Mutex<Vec<Bytes>>,
    batch_size: usize,
    downloads_started: AtomicUsize,
  }

  impl Platform for FakePlatform {
    fn calculate_optimal_batch_size(&self) -> usize {
      self.batch_size
    }

    fn download_file(&self, _url: &str) -> BoxStream<'static, Result<Bytes, ImportError>> {
      self.downloads_started.fetch_add(1, Ordering::SeqCst);
      let chunks = self.chunks.lock().unwrap().clone();
      Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
    }

    fn memory_pressure(&self) -> BoxStream<'static, MemoryPressure> {
      Box::pin(futures::stream::pending())
    }
  }

  fn setup_db() -> Arc<SqliteDatabase> {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch("CREATE TABLE tasks (id TEXT PRIMARY KEY, name TEXT, _status TEXT);")
      .unwrap();
    Arc::new(SqliteDatabase::new(conn))
  }

  #[tokio::test]
  async fn imports_one_table_one_row() {
    let compressed = build_single_row_slice();
    let db = setup_db();
    let platform = Arc::new(FakePlatform {
      chunks: std::sync::Mutex::new(vec![Bytes::from(compressed)]),
      batch_size: 100,
      downloads_started: AtomicUsize::new(0),
    });

    let engine = SliceImportEngine::new(db.clone(), platform);
    engine.start_import("https://example.invalid/slice").await.unwrap();

    assert_eq!(engine.total_rows_inserted(), 1);
    assert!(!engine.is_importing());
  }

  struct StalledPlatform;

  impl Platform for StalledPlatform {
    fn calculate_optimal_batch_size(&self) -> usize {
      100
    }

    fn download_file(&self, _url: &str) -> BoxStream<'static, Result<Bytes, ImportError>> {
      // Never resolves, so the import stays in-flight until cancelled.
      Box::pin(futures::stream::pending())
    }

    fn memory_pressure(&self) -> BoxStream<'static, MemoryPressure> {
      Box::pin(futures::stream::pending())
    }
  }

  #[tokio::test]
  async fn second_import_while_in_flight_is_busy() {
    let db = setup_db();
    let engine = Arc::new(SliceImportEngine::new(db, Arc::new(StalledPlatform)));

    let first = {
      let engine = engine.clone();
      tokio::spawn(async move { engine.start_import("https://example.invalid/slice").await })
    };
    tokio::task::yield_now().await;

    let second = engine.start_import("https://example.invalid/other").await;
    assert!(matches!(second, Err(ImportError::Busy)));

    engine.cancel();
    let first_result = first.await.unwrap();
    assert!(matches!(first_result, Err(ImportError::Cancelled)));
    assert!(!engine.is_importing());
  }
}
