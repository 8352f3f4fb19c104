use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Notify, Semaphore};

use slice_wire::{HeaderOutcome, RowOutcome, SliceDecoder, TableHeader, TableHeaderOutcome};
use sqlite_batch::{BatchData, DatabaseInterface};

use crate::error::ImportError;
use crate::platform::{MemoryPressure, Platform, DEFAULT_MAX_BATCH_SIZE};

/// Every Nth row-count, the import releases and recreates savepoint `sp` to
/// bound rollback cost (§4.4).
pub const SAVEPOINT_INTERVAL: u64 = 10_000;
/// Every Nth downloaded chunk, the decoder's buffer is compacted (§4.4).
pub const COMPACT_EVERY_N_CHUNKS: u64 = 16;

struct ImportState {
  importing: AtomicBool,
  total_rows_inserted: AtomicU64,
  cancel: Notify,
}

impl ImportState {
  fn new() -> Self {
    ImportState {
      importing: AtomicBool::new(false),
      total_rows_inserted: AtomicU64::new(0),
      cancel: Notify::new(),
    }
  }
}

/// Orchestrates one slice import end-to-end: download, decode, batch,
/// flush, and savepoint-cycle inside a single transaction (§4.4).
///
/// `start_import` is expressed as a single `async fn` rather than the
/// original callback-driven loop (per the REDESIGN FLAGS "callback as
/// control flow" note): awaiting it *is* the `onComplete` delivery, and a
/// `tokio::select!` over the download stream, the memory-pressure stream,
/// and the cancellation `Notify` is the "explicit driver" the design notes
/// ask for.
pub struct SliceImportEngine {
  db: Arc<dyn DatabaseInterface>,
  platform: Arc<dyn Platform>,
  state: Arc<ImportState>,
  flush_permit: Semaphore,
}

impl SliceImportEngine {
  pub fn new(db: Arc<dyn DatabaseInterface>, platform: Arc<dyn Platform>) -> Self {
    SliceImportEngine {
      db,
      platform,
      state: Arc::new(ImportState::new()),
      flush_permit: Semaphore::new(1),
    }
  }

  pub fn is_importing(&self) -> bool {
    self.state.importing.load(Ordering::SeqCst)
  }

  pub fn total_rows_inserted(&self) -> u64 {
    self.state.total_rows_inserted.load(Ordering::SeqCst)
  }

  /// Best-effort cancellation: the running `start_import` future observes
  /// this on its next `select!` iteration and completes with `Cancelled`.
  pub fn cancel(&self) {
    if self.state.importing.load(Ordering::SeqCst) {
      self.state.cancel.notify_one();
    }
  }

  pub async fn start_import(&self, url: &str) -> Result<(), ImportError> {
    if self.state.importing.swap(true, Ordering::SeqCst) {
      return Err(ImportError::Busy);
    }
    self.state.total_rows_inserted.store(0, Ordering::SeqCst);

    let result = self.run_import(url).await;

    if result.is_err() {
      self.db.rollback_transaction();
    }
    self.state.importing.store(false, Ordering::SeqCst);
    result
  }

  async fn run_import(&self, url: &str) -> Result<(), ImportError> {
    let mut decoder = SliceDecoder::new();
    decoder.initialize()?;

    self.db.apply_tuning_pragmas()?;
    self.db.begin_transaction()?;
    self.db.create_savepoint()?;

    let mut batch_size = self.platform.calculate_optimal_batch_size().min(DEFAULT_MAX_BATCH_SIZE);
    let mut batch = BatchData::new();
    let mut current_table: Option<TableHeader> = None;
    let mut header_parsed = false;
    let mut chunks_downloaded: u64 = 0;
    let mut savepoint_boundary_crossed: u64 = 0;

    let mut data_stream = self.platform.download_file(url);
    let mut pressure_stream = self.platform.memory_pressure();

    loop {
      tokio::select! {
        biased;

        _ = self.state.cancel.notified() => {
          return Err(ImportError::Cancelled);
        }

        pressure = pressure_stream.next() => {
          if let Some(level) = pressure {
            batch_size = match level {
              MemoryPressure::Warn => (batch_size / 2).max(250),
              MemoryPressure::Critical => (batch_size / 4).max(100),
            };
            log::warn!("memory pressure {:?}; batch size now {}", level, batch_size);
          }
        }

        chunk = data_stream.next() => {
          match chunk {
            Some(Ok(bytes)) => {
              decoder.feed(&bytes)?;
              chunks_downloaded += 1;
              self.drain_available(
                &mut decoder,
                &mut batch,
                &mut current_table,
                &mut header_parsed,
                batch_size,
                &mut savepoint_boundary_crossed,
              ).await?;
              if chunks_downloaded % COMPACT_EVERY_N_CHUNKS == 0 {
                decoder.compact();
              }
            }
            Some(Err(e)) => return Err(e),
            None => break,
          }
        }
      }
    }

    // Download finished: drain whatever is left, then require a clean end.
    self
      .drain_available(
        &mut decoder,
        &mut batch,
        &mut current_table,
        &mut header_parsed,
        batch_size,
        &mut savepoint_boundary_crossed,
      )
      .await?;

    if !decoder.is_end_of_stream() {
      return Err(ImportError::Truncated);
    }
    if decoder.remaining_bytes() != 0 {
      return Err(ImportError::IncompleteDecompression);
    }

    if !batch.is_empty() {
      self.flush(&mut batch).await?;
    }

    self.db.commit_transaction()?;
    Ok(())
  }

  /// Parses and batches everything currently available in the decoder's
  /// buffer, in source order: slice header once, then alternating table
  /// headers and rows, flushing and cycling the savepoint as thresholds are
  /// crossed. Stops at the first `NeedMore`.
  async fn drain_available(
    &self,
    decoder: &mut SliceDecoder,
    batch: &mut BatchData,
    current_table: &mut Option<TableHeader>,
    header_parsed: &mut bool,
    batch_size: usize,
    savepoint_boundary_crossed: &mut u64,
  ) -> Result<(), ImportError> {
    loop {
      if !*header_parsed {
        match decoder.parse_slice_header()? {
          HeaderOutcome::Ok(header) => {
            log::info!(
              "slice {} (version {}, priority {}) declares {} table(s)",
              header.slice_id,
              header.version,
              header.priority,
              header.number_of_tables
            );
            *header_parsed = true;
            continue;
          }
          HeaderOutcome::NeedMore => return Ok(()),
        }
      }

      if current_table.is_none() {
        match decoder.parse_table_header()? {
          TableHeaderOutcome::Ok(header) => {
            *current_table = Some(header);
            continue;
          }
          TableHeaderOutcome::NeedMore => return Ok(()),
          TableHeaderOutcome::EndOfStream => return Ok(()),
        }
      }

      let header = current_table.as_ref().unwrap();
      let before = decoder.remaining_bytes();
      match decoder.parse_row(&header.columns)? {
        RowOutcome::Ok(row) => {
          debug_assert!(decoder.remaining_bytes() < before, "row parse must strictly shrink remaining_bytes");
          let header = current_table.as_ref().unwrap();
          batch.push_row(&header.table_name, &header.columns, row.values);
          if batch.total_rows() >= batch_size {
            self.flush(batch).await?;
            self.maybe_cycle_savepoint(savepoint_boundary_crossed);
          }
        }
        RowOutcome::EndOfTable => {
          *current_table = None;
        }
        RowOutcome::NeedMore => return Ok(()),
      }
    }
  }

  async fn flush(&self, batch: &mut BatchData) -> Result<(), ImportError> {
    let _permit = self.flush_permit.acquire().await.expect("flush semaphore never closed");
    let started = std::time::Instant::now();
    let n = batch.total_rows() as u64;
    self.db.insert_batch(batch)?;
    log::debug!("flushed {} rows in {:?}", n, started.elapsed());
    self.state.total_rows_inserted.fetch_add(n, Ordering::SeqCst);
    batch.clear();
    Ok(())
  }

  /// Releases and recreates savepoint `sp` for every `SAVEPOINT_INTERVAL`
  /// boundary the running total has crossed since the last check, applying
  /// the cycle repeatedly if a single flush crossed more than one
  /// threshold. Failures are logged, not fatal (§4.4).
  fn maybe_cycle_savepoint(&self, boundary_crossed: &mut u64) {
    let total = self.state.total_rows_inserted.load(Ordering::SeqCst);
    while total / SAVEPOINT_INTERVAL > *boundary_crossed {
      *boundary_crossed += 1;
      if let Err(e) = self.db.release_savepoint() {
        log::warn!("savepoint release failed during cycling: {e}");
      }
      if let Err(e) = self.db.create_savepoint() {
        log::warn!("savepoint recreate failed during cycling: {e}");
      }
    }
  }
}
