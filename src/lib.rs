//! Facade crate re-exporting the native sync/import core's library crates
//! under one name, for embedders that want a single dependency.

pub use slice_import::{self as import, SliceImportEngine};
pub use slice_wire as wire;
pub use sqlite_batch as batch;
pub use sync_apply::{self as apply, SyncApplyEngine};
pub use sync_engine::{self as engine, SyncEngine};
