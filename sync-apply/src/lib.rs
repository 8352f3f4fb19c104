//! Decodes a pull-response JSON change-set into idempotent SQL mutations
//! inside a single transaction: per-row upserts, batched deletes, and the
//! monotonic `__watermelon_last_sequence_id` watermark (§4.5).

mod change_set;
mod engine;
mod error;
mod schema;

pub use change_set::ChangeEntry;
pub use engine::{SyncApplyEngine, LAST_SEQUENCE_ID_KEY};
pub use error::ApplyError;
