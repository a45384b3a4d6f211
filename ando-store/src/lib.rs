pub mod source;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use source::{ApplyMode, ApplyOutcome, ConfigSource};
