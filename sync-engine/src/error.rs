use thiserror::Error;

use sync_apply::ApplyError;

/// Abstract error kinds for the sync cycle, matching §7's `Network` /
/// `AuthRequired` / `Cancelled` / `Shutdown` kinds, plus a passthrough for
/// the internal pull→apply hookup.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
  #[error("network error: {0}")]
  Network(String),
  #[error("authentication required")]
  AuthRequired,
  #[error("cancelled_for_foreground")]
  Cancelled,
  #[error("sync_engine_shutdown")]
  Shutdown,
  #[error("apply failed: {0}")]
  Apply(String),
}

impl SyncError {
  pub fn message(&self) -> String {
    self.to_string()
  }
}

impl From<ApplyError> for SyncError {
  fn from(e: ApplyError) -> Self {
    SyncError::Apply(e.message())
  }
}
