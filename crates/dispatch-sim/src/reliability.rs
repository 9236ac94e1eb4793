use std::sync::atomic::{AtomicU64, Ordering};

use dispatch_core::{ConfigError, QueryFailure};

/// Failure injection consulted once per simulated query.
#[derive(Debug)]
pub enum ReliabilityStrategy {
    NeverFail,
    AlwaysFail,
    /// Fails unless the shared call counter is a multiple of `n`.
    ///
    /// The counter lives as long as the strategy and is not reset per term,
    /// so concurrent callers interleave against the same sequence.
    SucceedEveryNth { n: u64, calls: AtomicU64 },
}

impl ReliabilityStrategy {
    pub fn never_fail() -> Self {
        Self::NeverFail
    }

    pub fn always_fail() -> Self {
        Self::AlwaysFail
    }

    pub fn succeed_every_nth(n: u64) -> Result<Self, ConfigError> {
        if n == 0 {
            return Err(ConfigError::invalid("n", n, "must be at least 1"));
        }
        Ok(Self::SucceedEveryNth {
            n,
            calls: AtomicU64::new(0),
        })
    }

    pub fn check(&self) -> Result<(), QueryFailure> {
        match self {
            Self::NeverFail => Ok(()),
            Self::AlwaysFail => Err(QueryFailure::execution("simulated backend always fails")),
            Self::SucceedEveryNth { n, calls } => {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call % n == 0 {
                    Ok(())
                } else {
                    Err(QueryFailure::execution(format!(
                        "simulated backend succeeds only every {n} calls"
                    )))
                }
            }
        }
    }
}
