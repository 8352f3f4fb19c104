use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;

use crate::error::ImportError;

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// Memory-pressure levels the platform may report mid-import (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
  Warn,
  Critical,
}

/// Collaborator interface exposed by the embedding platform (§6). Reexpressed
/// in terms of streams rather than the original's `(onData, onComplete)`
/// callback pair plus opaque cancellation handle: dropping the stream *is*
/// cancellation, which removes the `DownloadHandle`/`MemoryAlertHandle`
/// bookkeeping the JS core needed but a `Stream`-based driver doesn't.
pub trait Platform: Send + Sync {
  /// A conservative function of physical RAM and CPU count, capped at
  /// 10 000 rows per batch.
  fn calculate_optimal_batch_size(&self) -> usize;

  /// Streams compressed bytes for `url` as they arrive. The stream ending
  /// (`None`) signals a completed download; an `Err` item signals a
  /// transport failure.
  fn download_file(&self, url: &str) -> BoxStream<'static, Result<Bytes, ImportError>>;

  /// Streams memory-pressure notifications for the lifetime of the import.
  /// A platform with no such source may return an always-pending stream.
  fn memory_pressure(&self) -> BoxStream<'static, MemoryPressure>;
}

pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;
const ROWS_PER_CORE: usize = 1_500;

/// Default `Platform` backed by `reqwest`, for the `import-slice` binary.
pub struct ReqwestPlatform {
  client: reqwest::Client,
}

impl ReqwestPlatform {
  pub fn new() -> Self {
    ReqwestPlatform { client: reqwest::Client::new() }
  }
}

impl Default for ReqwestPlatform {
  fn default() -> Self {
    Self::new()
  }
}

impl Platform for ReqwestPlatform {
  fn calculate_optimal_batch_size(&self) -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (cores * ROWS_PER_CORE).min(DEFAULT_MAX_BATCH_SIZE)
  }

  fn download_file(&self, url: &str) -> BoxStream<'static, Result<Bytes, ImportError>> {
    use futures::StreamExt;
    let client = self.client.clone();
    let url = url.to_string();
    Box::pin(
      futures::stream::once(async move { client.get(&url).send().await })
        .map(|result| match result {
          Ok(response) => match response.error_for_status() {
            Ok(response) => Box::pin(response.bytes_stream()) as BoxStream<'static, Result<Bytes, reqwest::Error>>,
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })) as BoxStream<'static, Result<Bytes, reqwest::Error>>,
          },
          Err(e) => Box::pin(futures::stream::once(async move { Err(e) })) as BoxStream<'static, Result<Bytes, reqwest::Error>>,
        })
        .flatten()
        .map(|r| r.map_err(|e| ImportError::Network(e.to_string()))),
    )
  }

  fn memory_pressure(&self) -> BoxStream<'static, MemoryPressure> {
    Box::pin(futures::stream::pending())
  }
}
