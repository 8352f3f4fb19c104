mod config;
mod engine;
mod error;
mod events;
mod providers;
mod transport;

pub use config::SyncConfig;
pub use engine::SyncEngine;
pub use error::SyncError;
pub use events::SyncEvent;
pub use providers::{AuthTokenProvider, PushChangesProvider, ScopedPushOverride};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
