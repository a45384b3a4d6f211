pub mod coalescer;
pub mod entry;
pub mod key;
pub mod policy;
pub mod store;

pub use coalescer::{Coalescer, Flight, StartOutcome, WaitOutcome};
pub use entry::CacheEntry;
pub use key::{CacheKey, Partition};
pub use policy::{classify_response, is_cacheable_method, is_cacheable_status, ResponseDirective};
pub use store::{CacheStore, SetError};
