pub mod config;
pub mod error;
pub mod limits;
pub mod policy;
pub mod pool;
pub mod route;
pub mod router;
pub mod snapshot;
pub mod store;
pub mod tls;

pub use config::AndoConfig;
pub use error::{AndoError, ErrorCategory, ProxyError};
pub use limits::Limits;
pub use policy::Policy;
pub use pool::PoolKey;
pub use route::CompiledRoute;
pub use router::Router;
pub use snapshot::{PoolRuntimeConfig, Snapshot};
pub use store::{SnapshotHandle, SnapshotStore};
