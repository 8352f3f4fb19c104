use serde_json::{json, Value};

/// An event emitted over [`crate::SyncEngine::subscribe`]. Wraps the raw
/// JSON object shape from §6 directly rather than a `serde`-derived enum:
/// event payloads mix `{"type":...}` and `{"state":...}` shapes, so a
/// `Value` is the most faithful representation.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent(pub Value);

impl SyncEvent {
  pub fn to_json_string(&self) -> String {
    self.0.to_string()
  }

  pub fn configured() -> Self {
    SyncEvent(json!({ "state": "configured" }))
  }

  pub fn sync_start(reason: &str) -> Self {
    SyncEvent(json!({ "type": "sync_start", "reason": reason }))
  }

  pub fn sync_queued(reason: &str) -> Self {
    SyncEvent(json!({ "type": "sync_queued", "reason": reason }))
  }

  pub fn state(name: &str) -> Self {
    SyncEvent(json!({ "state": name }))
  }

  pub fn phase(phase: &str, attempt: u32) -> Self {
    SyncEvent(json!({ "type": "phase", "phase": phase, "attempt": attempt }))
  }

  pub fn http(phase: &str, status: u16) -> Self {
    SyncEvent(json!({ "type": "http", "phase": phase, "status": status }))
  }

  pub fn retry_scheduled(attempt: u32, delay_ms: u64, message: &str) -> Self {
    SyncEvent(json!({ "type": "retry_scheduled", "attempt": attempt, "delayMs": delay_ms, "message": message }))
  }

  pub fn auth_required() -> Self {
    SyncEvent(json!({ "type": "auth_required" }))
  }

  pub fn drain_queue() -> Self {
    SyncEvent(json!({ "type": "drain_queue" }))
  }

  pub fn error(message: &str) -> Self {
    SyncEvent(json!({ "type": "error", "message": message }))
  }

  pub fn sync_cancelled() -> Self {
    SyncEvent(json!({ "type": "sync_cancelled" }))
  }
}
