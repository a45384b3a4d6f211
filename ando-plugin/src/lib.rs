pub mod breaker;
pub mod context;
pub mod pipeline;
pub mod transport;

pub use breaker::{FilterBreaker, FilterBreakerRegistry, FilterBreakerState};
pub use context::{apply_mutations, MutationResult};
pub use pipeline::{PhaseOutcome, PluginPipeline, RequestPhaseInput, ResponsePhaseInput};
pub use transport::{FilterRequestBody, FilterResponseBody, HttpJsonTransport, PluginTransport, TransportError};
