//! Core search-as-you-type dispatch contract.
//!
//! This crate turns a stream of input-changed events into a stream of
//! authoritative query results: latest input wins, every backend call is
//! bounded by a timeout, transient failures are retried with backoff, and
//! terminal failures are rendered as placeholder results.

/// Input/result/lifecycle channel primitives.
pub mod channel;
/// Query failure taxonomy and configuration errors.
pub mod error;
/// Failure-to-placeholder conversion at the pipeline boundary.
pub mod normalization;
/// Dispatch loop wiring timeout, retry and latest-wins cancellation.
pub mod pipeline;
/// Backoff plans and the retry-with-backoff operator.
pub mod retry;
/// Backend query service contract.
pub mod service;
/// Latest-wins dispatch state machine.
pub mod state_machine;
/// Real and virtual time sources.
pub mod time;
/// Timeout wrapper routed through a time source.
pub mod timeout;
/// Data model shared with presentation consumers.
pub mod types;

pub use channel::{PipelineChannelError, PipelineChannels, PipelineEventStream};
pub use error::{ConfigError, DispatchError, QueryFailure};
pub use normalization::{Delivery, normalize_outcome};
pub use pipeline::{DEFAULT_QUERY_TIMEOUT, PipelineConfig, PipelineHandle, QueryPipeline};
pub use retry::{BackoffPlan, RetryPolicy, RetryWithBackoff};
pub use service::{QueryService, SharedQueryService};
pub use state_machine::DispatchStateMachine;
pub use time::{SharedTimeSource, TimeSource, TokioTimeSource, VirtualTimeSource};
pub use timeout::with_timeout;
pub use types::{AttemptIndex, DispatchState, PipelineEvent, QueryResult, SearchTerm};
