use std::{future::Future, time::Duration};

use tracing::debug;

use crate::{error::QueryFailure, time::TimeSource};

/// Bound `operation` by `limit` on `time`.
///
/// On expiry the operation future is dropped, which cancels the underlying
/// call, and [`QueryFailure::Timeout`] is returned. An operation that settles
/// at exactly the deadline wins the race.
pub async fn with_timeout<T, Fut>(
    time: &dyn TimeSource,
    limit: Duration,
    operation: Fut,
) -> Result<T, QueryFailure>
where
    Fut: Future<Output = Result<T, QueryFailure>>,
{
    let expiry = time.sleep(limit);
    tokio::select! {
        biased;
        outcome = operation => outcome,
        _ = expiry => {
            debug!(limit_ms = limit.as_millis() as u64, "operation timed out");
            Err(QueryFailure::Timeout)
        }
    }
}
