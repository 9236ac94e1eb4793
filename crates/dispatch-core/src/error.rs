use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DispatchState;

/// Why a single query execution did not produce a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum QueryFailure {
    /// The operation did not complete within its time bound.
    #[error("query timed out")]
    Timeout,
    /// The underlying call failed, possibly after exhausting retries.
    #[error("query failed: {cause}")]
    ExecutionError { cause: String },
    /// Superseded by a newer input event. Never rendered.
    #[error("query cancelled")]
    Cancelled,
}

impl QueryFailure {
    pub fn execution(cause: impl Into<String>) -> Self {
        Self::ExecutionError {
            cause: cause.into(),
        }
    }

    /// Whether another attempt may succeed where this one failed.
    ///
    /// Timeouts are terminal: a slow query is reported as timed out rather
    /// than re-issued against the same bound.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionError { .. })
    }

    /// Placeholder reason shown to the user, or `None` for silent failures.
    pub fn placeholder_reason(&self) -> Option<&'static str> {
        match self {
            Self::Timeout => Some("timed out"),
            Self::ExecutionError { .. } => Some("failed"),
            Self::Cancelled => None,
        }
    }
}

/// Invalid construction-time configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A configuration value is outside its accepted range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(
        key: &'static str,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Illegal transition requested from the dispatch state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("cannot run '{action}' while dispatcher is in state {state:?}")]
    InvalidTransition {
        state: DispatchState,
        action: &'static str,
    },
}

impl DispatchError {
    /// Stable machine-readable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_state_transition",
        }
    }
}
