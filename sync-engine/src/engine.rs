use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, Mutex, Notify};

use sqlite_batch::DatabaseInterface;
use sync_apply::SyncApplyEngine;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::providers::{AuthTokenProvider, PushChangesProvider, ScopedPushOverride};
use crate::transport::{HttpMethod, HttpRequest, HttpTransport};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Idle,
  Configured,
  SyncRequested,
  Syncing,
  RetryScheduled,
  AuthRequired,
  WaitingForQueue,
  Done,
  Error,
}

impl Phase {
  fn as_str(self) -> &'static str {
    match self {
      Phase::Idle => "idle",
      Phase::Configured => "configured",
      Phase::SyncRequested => "sync_requested",
      Phase::Syncing => "syncing",
      Phase::RetryScheduled => "retry_scheduled",
      Phase::AuthRequired => "auth_required",
      Phase::WaitingForQueue => "waiting_for_queue",
      Phase::Done => "done",
      Phase::Error => "error",
    }
  }
}

/// Cancellation/resume signaling scoped to exactly one running cycle. A
/// fresh one is created per cycle so a stale cycle's awaiters can never be
/// woken by a later, unrelated cycle (§4.6's "cycle freshness").
struct CycleControl {
  cancel: Notify,
  cancelled: AtomicBool,
  token_updated: Notify,
  queue_drained: Notify,
}

impl CycleControl {
  fn new() -> Self {
    CycleControl {
      cancel: Notify::new(),
      cancelled: AtomicBool::new(false),
      token_updated: Notify::new(),
      queue_drained: Notify::new(),
    }
  }
}

type PendingSlot = Option<(String, Option<oneshot::Sender<(bool, String)>>)>;

struct StateData {
  phase: Phase,
  config: Option<SyncConfig>,
  token: Option<String>,
  sync_id: u64,
  in_flight: bool,
  pending: PendingSlot,
  shutdown: bool,
  auth_provider: Option<Arc<dyn AuthTokenProvider>>,
  push_provider: Option<Arc<dyn PushChangesProvider>>,
  cycle_control: Option<Arc<CycleControl>>,
}

impl StateData {
  fn new() -> Self {
    StateData {
      phase: Phase::Idle,
      config: None,
      token: None,
      sync_id: 0,
      in_flight: false,
      pending: None,
      shutdown: false,
      auth_provider: None,
      push_provider: None,
      cycle_control: None,
    }
  }
}

struct Inner {
  state: Mutex<StateData>,
  events_tx: broadcast::Sender<SyncEvent>,
  http: Arc<dyn HttpTransport>,
  db: Arc<dyn DatabaseInterface>,
  apply_engine: Mutex<SyncApplyEngine>,
}

/// Pull/apply/push/drain state-machine handle (§4.6). Cheaply `Clone`: all
/// instances share the same underlying cycle via an `Arc`.
#[derive(Clone)]
pub struct SyncEngine {
  inner: Arc<Inner>,
}

impl SyncEngine {
  pub fn new(db: Arc<dyn DatabaseInterface>, http: Arc<dyn HttpTransport>) -> Self {
    let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    SyncEngine {
      inner: Arc::new(Inner {
        state: Mutex::new(StateData::new()),
        events_tx,
        http,
        db,
        apply_engine: Mutex::new(SyncApplyEngine::new()),
      }),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events_tx.subscribe()
  }

  pub async fn state_json(&self) -> String {
    let phase = self.inner.state.lock().await.phase;
    SyncEvent::state(phase.as_str()).to_json_string()
  }

  pub async fn configure(&self, payload_json: &str) -> Result<(), SyncError> {
    let config = SyncConfig::from_json(payload_json).map_err(|e| SyncError::Apply(e.to_string()))?;
    {
      let mut st = self.inner.state.lock().await;
      st.config = Some(config);
      st.phase = Phase::Configured;
    }
    self.emit(SyncEvent::configured());
    Ok(())
  }

  pub async fn set_auth_provider(&self, provider: Option<Arc<dyn AuthTokenProvider>>) {
    self.inner.state.lock().await.auth_provider = provider;
  }

  pub async fn set_push_provider(&self, provider: Option<Arc<dyn PushChangesProvider>>) {
    self.inner.state.lock().await.push_provider = provider;
  }

  /// Overrides the push provider for the lifetime of the returned guard;
  /// dropping it restores whatever was configured before, on every exit
  /// path (§9's `ScopedPushOverride`).
  pub async fn override_push_provider(&self, provider: Arc<dyn PushChangesProvider>) -> ScopedPushOverride<'_> {
    let previous = {
      let mut st = self.inner.state.lock().await;
      std::mem::replace(&mut st.push_provider, Some(provider))
    };
    ScopedPushOverride::new(self, previous)
  }

  pub(crate) fn restore_push_provider(&self, previous: Option<Arc<dyn PushChangesProvider>>) {
    let inner = self.inner.clone();
    tokio::spawn(async move {
      inner.state.lock().await.push_provider = previous;
    });
  }

  pub async fn set_auth_token(&self, token: impl Into<String>) {
    let token = token.into();
    let (ctrl, should_restart) = {
      let mut st = self.inner.state.lock().await;
      st.token = Some(token);
      let ctrl = st.cycle_control.clone();
      let should_restart = ctrl.is_none() && st.phase == Phase::AuthRequired && !st.in_flight;
      (ctrl, should_restart)
    };
    if let Some(ctrl) = ctrl {
      ctrl.token_updated.notify_waiters();
    }
    if should_restart {
      self.start("auth_token_updated");
    }
  }

  pub async fn clear_auth_token(&self) {
    self.inner.state.lock().await.token = None;
  }

  /// Starts a cycle, or queues `reason` if one is already in flight.
  /// Returns immediately; fire-and-forget, matching the original's
  /// callback-return-then-later-onComplete shape.
  pub fn start(&self, reason: impl Into<String>) {
    let inner = self.inner.clone();
    let engine = self.clone();
    let reason = reason.into();
    tokio::spawn(async move {
      let _ = Inner::dispatch(inner, &engine, reason, None).await;
    });
  }

  /// Same as `start`, but guarantees exactly one `(success, message)` is
  /// produced for this call — including while queued, cancelled, or during
  /// shutdown.
  pub async fn start_with_completion(&self, reason: impl Into<String>) -> (bool, String) {
    let (tx, rx) = oneshot::channel();
    match Inner::dispatch(self.inner.clone(), self, reason.into(), Some(tx)).await {
      Some(result) => result,
      None => rx.await.unwrap_or_else(|_| (false, "sync_engine_shutdown".to_string())),
    }
  }

  /// Best-effort abort of the in-flight cycle (and any queued one). No-op
  /// when idle.
  pub async fn cancel_sync(&self) {
    let (ctrl, pending, was_in_flight) = {
      let mut st = self.inner.state.lock().await;
      let ctrl = st.cycle_control.clone();
      let pending = st.pending.take();
      (ctrl, pending, st.in_flight)
    };

    if ctrl.is_none() && !was_in_flight {
      return;
    }

    if let Some(ctrl) = &ctrl {
      ctrl.cancelled.store(true, Ordering::SeqCst);
      ctrl.cancel.notify_waiters();
      ctrl.token_updated.notify_waiters();
      ctrl.queue_drained.notify_waiters();
    }
    if let Some((_, Some(tx))) = pending {
      let _ = tx.send((false, "cancelled_for_foreground".to_string()));
    }

    // Wait for the cycle task to actually unwind so state is quiescent by
    // the time cancel_sync returns (a subsequent start() should see idle).
    for _ in 0..10_000 {
      if !self.inner.state.lock().await.in_flight {
        break;
      }
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
  }

  pub async fn notify_queue_drained(&self) {
    let ctrl = self.inner.state.lock().await.cycle_control.clone();
    if let Some(ctrl) = ctrl {
      ctrl.queue_drained.notify_waiters();
    }
  }

  pub async fn shutdown(&self) {
    let (ctrl, pending) = {
      let mut st = self.inner.state.lock().await;
      st.shutdown = true;
      st.auth_provider = None;
      st.push_provider = None;
      (st.cycle_control.take(), st.pending.take())
    };
    if let Some(ctrl) = ctrl {
      ctrl.cancelled.store(true, Ordering::SeqCst);
      ctrl.cancel.notify_waiters();
      ctrl.token_updated.notify_waiters();
      ctrl.queue_drained.notify_waiters();
    }
    if let Some((_, Some(tx))) = pending {
      let _ = tx.send((false, "sync_engine_shutdown".to_string()));
    }
  }

  fn emit(&self, event: SyncEvent) {
    let _ = self.inner.events_tx.send(event);
  }
}

impl Inner {
  /// Either begins a fresh cycle inline (returning `Some(result)`) or
  /// queues it behind the in-flight one (returning `None`, with
  /// `responder` fulfilled later by whichever cycle drains the queue).
  async fn dispatch(
    self: Arc<Self>,
    engine: &SyncEngine,
    reason: String,
    responder: Option<oneshot::Sender<(bool, String)>>,
  ) -> Option<(bool, String)> {
    let queued = {
      let mut st = self.state.lock().await;
      if st.shutdown {
        return Some((false, "sync_engine_shutdown".to_string()));
      }
      if st.in_flight {
        st.pending = Some((reason.clone(), responder));
        true
      } else {
        false
      }
    };
    if queued {
      engine.emit(SyncEvent::sync_queued(&reason));
      return None;
    }
    let result = self.clone().run_cycle_and_drain(engine, reason).await;
    Some(result)
  }

  async fn run_cycle_and_drain(self: Arc<Self>, engine: &SyncEngine, reason: String) -> (bool, String) {
    let result = self.run_one_cycle(engine, reason).await;
    let next = {
      let mut st = self.state.lock().await;
      st.in_flight = false;
      let next = st.pending.take();
      // Only fall back to idle here when there's no queued reason to run
      // next; otherwise the terminal phase finish_cycle/finish_cancelled
      // just set (done/error/idle) stays observable via state_json() until
      // the queued cycle actually starts and overwrites it itself.
      if next.is_none() {
        st.phase = Phase::Idle;
      }
      next
    };
    if let Some((next_reason, next_responder)) = next {
      let inner = self.clone();
      let engine = engine.clone();
      tokio::spawn(async move {
        let result = inner.run_cycle_and_drain(&engine, next_reason).await;
        if let Some(tx) = next_responder {
          let _ = tx.send(result);
        }
      });
    }
    result
  }

  async fn run_one_cycle(&self, engine: &SyncEngine, reason: String) -> (bool, String) {
    let (sync_id, ctrl) = {
      let mut st = self.state.lock().await;
      st.in_flight = true;
      st.sync_id += 1;
      let ctrl = Arc::new(CycleControl::new());
      st.cycle_control = Some(ctrl.clone());
      st.phase = Phase::SyncRequested;
      (st.sync_id, ctrl)
    };
    engine.emit(SyncEvent::sync_start(&reason));
    engine.emit(SyncEvent::state("sync_requested"));

    let config = {
      let st = self.state.lock().await;
      st.config.clone()
    };
    let config = match config {
      Some(c) => c,
      None => return self.finish_cycle(engine, false, "sync engine not configured".to_string(), Phase::Error).await,
    };

    self.state.lock().await.phase = Phase::Syncing;
    engine.emit(SyncEvent::state("syncing"));

    let request_id = format!("req-{sync_id}");
    let mut cursor = config.initial_cursor.clone();
    let mut attempt: u32 = 1;

    loop {
      if ctrl.cancelled.load(Ordering::SeqCst) {
        return self.finish_cancelled(engine).await;
      }

      engine.emit(SyncEvent::phase("pull", attempt));

      let token = self.state.lock().await.token.clone();
      let url = build_pull_url(&config.pull_endpoint_url, cursor.as_deref());
      let mut headers = HashMap::new();
      headers.insert("Accept".to_string(), "application/json".to_string());
      headers.insert("X-Request-Id".to_string(), request_id.clone());
      if let Some(t) = &token {
        headers.insert("Authorization".to_string(), format!("Bearer {t}"));
      }
      let request =
        HttpRequest { method: HttpMethod::Get, url, headers, body: None, timeout: Duration::from_millis(config.timeout_ms) };

      let response = tokio::select! {
        biased;
        _ = ctrl.cancel.notified() => return self.finish_cancelled(engine).await,
        resp = self.http.execute(request) => resp,
      };
      if ctrl.cancelled.load(Ordering::SeqCst) {
        return self.finish_cancelled(engine).await;
      }

      engine.emit(SyncEvent::http("pull", response.status_code));

      if response.is_success() {
        match self.apply_page(&response.body).await {
          Ok(Some(next_cursor)) => {
            cursor = Some(next_cursor);
            attempt = 1;
            continue;
          }
          Ok(None) => break,
          Err(e) => return self.finish_cycle(engine, false, e.message(), Phase::Error).await,
        }
      } else if response.is_auth_required() {
        match self.handle_auth_required(engine, &ctrl).await {
          Some(new_token) => {
            self.state.lock().await.token = Some(new_token);
            self.state.lock().await.phase = Phase::Syncing;
            continue;
          }
          None => return self.finish_cancelled(engine).await,
        }
      } else if response.is_retryable() {
        if attempt > config.max_retries {
          let message = response
            .error_message
            .clone()
            .unwrap_or_else(|| format!("pull failed with status {}", response.status_code));
          return self.finish_cycle(engine, false, message, Phase::Error).await;
        }
        let delay_ms = retry_delay_ms(config.retry_initial_ms, attempt, config.retry_max_ms);
        let message =
          response.error_message.clone().unwrap_or_else(|| format!("status {}", response.status_code));
        engine.emit(SyncEvent::retry_scheduled(attempt + 1, delay_ms, &message));
        self.state.lock().await.phase = Phase::RetryScheduled;

        let cancelled = tokio::select! {
          biased;
          _ = ctrl.cancel.notified() => true,
          _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
        };
        if cancelled || ctrl.cancelled.load(Ordering::SeqCst) {
          return self.finish_cancelled(engine).await;
        }
        self.state.lock().await.phase = Phase::Syncing;
        attempt += 1;
        continue;
      } else {
        let message = response
          .error_message
          .clone()
          .unwrap_or_else(|| format!("pull failed with status {}", response.status_code));
        return self.finish_cycle(engine, false, message, Phase::Error).await;
      }
    }

    self.drain_to_push(engine, &ctrl).await
  }

  async fn apply_page(&self, body: &str) -> Result<Option<String>, SyncError> {
    let root: serde_json::Value = serde_json::from_str(body).map_err(|e| SyncError::Apply(e.to_string()))?;
    let (changes, next) = match &root {
      serde_json::Value::Array(_) => (root.clone(), None),
      serde_json::Value::Object(map) => {
        (map.get("changes").cloned().unwrap_or(serde_json::Value::Array(Vec::new())), map.get("next").cloned())
      }
      _ => return Err(SyncError::Apply("pull response must be a JSON array or object".to_string())),
    };

    let mut apply_engine = self.apply_engine.lock().await;
    apply_engine.apply(self.db.as_ref(), &changes.to_string())?;
    Ok(encode_next_cursor(next))
  }

  async fn handle_auth_required(&self, engine: &SyncEngine, ctrl: &Arc<CycleControl>) -> Option<String> {
    self.state.lock().await.phase = Phase::AuthRequired;
    engine.emit(SyncEvent::auth_required());

    let provider = self.state.lock().await.auth_provider.clone();
    if let Some(provider) = provider {
      let token = tokio::select! {
        biased;
        _ = ctrl.cancel.notified() => return None,
        t = provider.request_token() => t,
      };
      if token.is_some() {
        return token;
      }
      // Provider could not supply one; fall through to wait for an
      // externally-delivered token via `set_auth_token`.
    }

    tokio::select! {
      biased;
      _ = ctrl.cancel.notified() => None,
      _ = ctrl.token_updated.notified() => self.state.lock().await.token.clone(),
    }
  }

  async fn drain_to_push(&self, engine: &SyncEngine, ctrl: &Arc<CycleControl>) -> (bool, String) {
    self.state.lock().await.phase = Phase::WaitingForQueue;
    engine.emit(SyncEvent::drain_queue());

    let provider = self.state.lock().await.push_provider.clone();
    if let Some(provider) = provider {
      let outcome = tokio::select! {
        biased;
        _ = ctrl.cancel.notified() => return self.finish_cancelled(engine).await,
        outcome = provider.push_changes() => outcome,
      };
      if ctrl.cancelled.load(Ordering::SeqCst) {
        return self.finish_cancelled(engine).await;
      }
      let (success, message) = outcome;
      if success {
        self.finish_cycle(engine, true, String::new(), Phase::Done).await
      } else {
        self.finish_cycle(engine, false, message, Phase::Error).await
      }
    } else {
      tokio::select! {
        biased;
        _ = ctrl.cancel.notified() => return self.finish_cancelled(engine).await,
        _ = ctrl.queue_drained.notified() => {}
      }
      if ctrl.cancelled.load(Ordering::SeqCst) {
        return self.finish_cancelled(engine).await;
      }
      self.finish_cycle(engine, true, String::new(), Phase::Done).await
    }
  }

  async fn finish_cycle(&self, engine: &SyncEngine, success: bool, message: String, phase: Phase) -> (bool, String) {
    {
      let mut st = self.state.lock().await;
      st.phase = phase;
      st.cycle_control = None;
    }
    match phase {
      Phase::Done => engine.emit(SyncEvent::state("done")),
      Phase::Error => {
        engine.emit(SyncEvent::error(&message));
        engine.emit(SyncEvent::state("error"));
      }
      _ => {}
    }
    (success, message)
  }

  async fn finish_cancelled(&self, engine: &SyncEngine) -> (bool, String) {
    {
      let mut st = self.state.lock().await;
      st.phase = Phase::Idle;
      st.cycle_control = None;
    }
    engine.emit(SyncEvent::sync_cancelled());
    (false, "cancelled_for_foreground".to_string())
  }
}

fn build_pull_url(base: &str, cursor: Option<&str>) -> String {
  match cursor {
    Some(c) => {
      let encoded: String = url::form_urlencoded::byte_serialize(c.as_bytes()).collect();
      if base.contains('?') {
        format!("{base}&cursor={encoded}")
      } else {
        format!("{base}?cursor={encoded}")
      }
    }
    None => base.to_string(),
  }
}

fn encode_next_cursor(next: Option<serde_json::Value>) -> Option<String> {
  match next {
    None | Some(serde_json::Value::Null) => None,
    Some(serde_json::Value::String(s)) => Some(s),
    Some(other) => Some(other.to_string()),
  }
}

fn retry_delay_ms(initial_ms: u64, attempt: u32, max_ms: u64) -> u64 {
  let shift = attempt.saturating_sub(1).min(63);
  initial_ms.checked_shl(shift).unwrap_or(u64::MAX).min(max_ms)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retry_delay_doubles_and_caps() {
    assert_eq!(retry_delay_ms(1000, 1, 30_000), 1000);
    assert_eq!(retry_delay_ms(1000, 2, 30_000), 2000);
    assert_eq!(retry_delay_ms(1000, 20, 30_000), 30_000);
  }

  #[test]
  fn next_cursor_prefers_string_then_json_encodes_objects() {
    assert_eq!(encode_next_cursor(None), None);
    assert_eq!(encode_next_cursor(Some(serde_json::Value::Null)), None);
    assert_eq!(encode_next_cursor(Some(serde_json::json!("abc"))), Some("abc".to_string()));
    assert_eq!(
      encode_next_cursor(Some(serde_json::json!({"page": 2}))),
      Some("{\"page\":2}".to_string())
    );
  }

  #[test]
  fn pull_url_appends_urlencoded_cursor() {
    assert_eq!(build_pull_url("https://x/pull", None), "https://x/pull");
    assert_eq!(build_pull_url("https://x/pull", Some("a b")), "https://x/pull?cursor=a+b");
  }
}
