use serde::Deserialize;

fn default_timeout_ms() -> u64 {
  30_000
}
fn default_max_retries() -> u32 {
  3
}
fn default_retry_initial_ms() -> u64 {
  1_000
}
fn default_retry_max_ms() -> u64 {
  30_000
}

/// `configure()`'s JSON payload (§6). Deserialized with `serde_json`;
/// unrecognized keys (e.g. a future server-side addition) are ignored by
/// `serde`'s default behavior rather than rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
  pub pull_endpoint_url: String,
  pub connection_tag: i64,
  /// Not read by the engine — a collaborator's concern (§6 supplement) —
  /// kept only so a real-world config payload round-trips without error.
  #[serde(default)]
  pub socketio_url: Option<String>,
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_retry_initial_ms")]
  pub retry_initial_ms: u64,
  #[serde(default = "default_retry_max_ms")]
  pub retry_max_ms: u64,
  /// Optional resume hints for a first `start()` after `configure()`.
  #[serde(default)]
  pub initial_cursor: Option<String>,
  #[serde(default)]
  pub initial_sequence_id: Option<String>,
}

impl SyncConfig {
  pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
    let mut config: SyncConfig = serde_json::from_str(payload)?;
    if config.retry_max_ms < config.retry_initial_ms {
      config.retry_max_ms = config.retry_initial_ms;
    }
    Ok(config)
  }
}
