//! Simulated query backend for exercising the dispatch pipeline.
//!
//! The service composes an artificial delay with failure injection and
//! produces throwaway matches. Delays run on the injected time source, so a
//! virtual clock drives it deterministically.

/// Artificial latency strategies.
pub mod delay;
/// Stand-in match payloads.
pub mod matches;
/// Failure injection strategies.
pub mod reliability;
/// In-memory query service.
pub mod service;

pub use delay::{DelayStrategy, RoundRobinDelay};
pub use matches::{DEFAULT_MATCH_COUNT, MatchGenerator};
pub use reliability::ReliabilityStrategy;
pub use service::InMemoryQueryService;
