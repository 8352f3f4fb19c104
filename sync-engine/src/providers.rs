use async_trait::async_trait;

/// Async producer of a fresh auth token. A `None` return signals "cannot
/// provide" — the cycle remains in `auth_required` until cancelled (§6).
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
  async fn request_token(&self) -> Option<String>;
}

/// Async producer that flushes local mutations to the server and reports
/// whether the push succeeded (§6).
#[async_trait]
pub trait PushChangesProvider: Send + Sync {
  async fn push_changes(&self) -> (bool, String);
}

/// RAII guard that overrides a `SyncEngine`'s push provider for its
/// lifetime and restores the previous one on drop — including on every
/// early-return / panic-unwind path. Named per §9's design note: the
/// original "save push callback, set no-op, restore on completion" pattern
/// is a bug class (a failure path can forget to restore) that a scope
/// guard eliminates structurally.
pub struct ScopedPushOverride<'a> {
  engine: &'a super::SyncEngine,
  previous: std::sync::Mutex<Option<std::sync::Arc<dyn PushChangesProvider>>>,
}

impl<'a> ScopedPushOverride<'a> {
  pub(crate) fn new(
    engine: &'a super::SyncEngine,
    previous: Option<std::sync::Arc<dyn PushChangesProvider>>,
  ) -> Self {
    ScopedPushOverride { engine, previous: std::sync::Mutex::new(previous) }
  }
}

impl Drop for ScopedPushOverride<'_> {
  fn drop(&mut self) {
    let previous = self.previous.lock().unwrap().take();
    self.engine.restore_push_provider(previous);
  }
}
