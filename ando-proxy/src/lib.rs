pub mod builder;
pub mod engine;
pub mod handler;
pub mod retry;
pub mod state;

pub use builder::SnapshotBuilder;
pub use engine::{AttemptContext, AttemptOutcome, Engine};
pub use handler::{handle, ConnectionInfo};
pub use retry::{resolve_client_cap_key, RetryExecutor, RetryOutcome, RetryRequest};
pub use state::ProxyState;
