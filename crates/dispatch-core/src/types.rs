use std::{fmt, ops::Deref};

use serde::{Deserialize, Serialize};

/// Zero-based attempt counter scoped to one logical query invocation.
pub type AttemptIndex = u32;

/// Full text of the input box at the time of an input-changed event.
///
/// The pipeline never trims or case-folds terms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(transparent)]
pub struct SearchTerm(String);

impl SearchTerm {
    pub fn new(term: impl Into<String>) -> Self {
        Self(term.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Deref for SearchTerm {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SearchTerm {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SearchTerm {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Terminal value handed to the presentation layer.
///
/// The presentation contract is "replace the displayed list with `matches`".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryResult {
    /// Term this result answers.
    pub term: SearchTerm,
    /// Ordered matches, or a single placeholder line for a failed query.
    pub matches: Vec<String>,
}

impl QueryResult {
    pub fn new(term: SearchTerm, matches: Vec<String>) -> Self {
        Self { term, matches }
    }

    /// Build a placeholder result rendered as `Query(<term>) <reason>`.
    pub fn error_placeholder(term: SearchTerm, reason: &str) -> Self {
        let line = format!("Query({term}) {reason}");
        Self {
            term,
            matches: vec![line],
        }
    }

    /// Placeholder for a query that failed after exhausting its retries.
    pub fn failed(term: SearchTerm) -> Self {
        Self::error_placeholder(term, "failed")
    }

    /// Placeholder for a query that exceeded its time bound.
    pub fn timed_out(term: SearchTerm) -> Self {
        Self::error_placeholder(term, "timed out")
    }
}

/// Dispatch lifecycle reported to pipeline observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DispatchState {
    /// Waiting for the next input event.
    Idle,
    /// An input event was accepted and its query is being started.
    Dispatching,
    /// The wrapped query is in flight.
    AwaitingResult,
    /// A terminal result is being handed downstream.
    Delivering,
}

/// Best-effort lifecycle notifications emitted by the pipeline.
///
/// These are observational only; results travel on their own channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PipelineEvent {
    /// The dispatch state machine moved to `state`.
    StateChanged { state: DispatchState },
    /// A query was started for `term`.
    QueryDispatched { generation: u64, term: SearchTerm },
    /// An in-flight query was cancelled by a newer input event.
    QuerySuperseded { generation: u64, term: SearchTerm },
    /// A failed attempt will be retried after `delay_ms`.
    RetryScheduled {
        term: SearchTerm,
        attempt: AttemptIndex,
        delay_ms: u64,
    },
    /// A terminal result for `term` was handed to the presentation layer.
    ResultDelivered {
        generation: u64,
        term: SearchTerm,
        /// `true` when the result is a synthesized failure placeholder.
        placeholder: bool,
    },
}
