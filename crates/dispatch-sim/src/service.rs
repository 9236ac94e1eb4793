use std::sync::atomic::{AtomicU64, Ordering};

use dispatch_core::{QueryFailure, QueryResult, QueryService, SearchTerm, SharedTimeSource};
use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::{delay::DelayStrategy, matches::MatchGenerator, reliability::ReliabilityStrategy};

/// Simulated backend: delay first, then failure injection, then matches.
///
/// Strategy counters are shared by every call made through one instance.
#[derive(Debug)]
pub struct InMemoryQueryService {
    time: SharedTimeSource,
    delay: DelayStrategy,
    reliability: ReliabilityStrategy,
    matches: MatchGenerator,
    invocations: AtomicU64,
}

impl InMemoryQueryService {
    /// No delay, never fails.
    pub fn new(time: SharedTimeSource) -> Self {
        Self::with_strategies(time, DelayStrategy::none(), ReliabilityStrategy::never_fail())
    }

    pub fn with_delay(time: SharedTimeSource, delay: DelayStrategy) -> Self {
        Self::with_strategies(time, delay, ReliabilityStrategy::never_fail())
    }

    pub fn with_reliability(time: SharedTimeSource, reliability: ReliabilityStrategy) -> Self {
        Self::with_strategies(time, DelayStrategy::none(), reliability)
    }

    pub fn with_strategies(
        time: SharedTimeSource,
        delay: DelayStrategy,
        reliability: ReliabilityStrategy,
    ) -> Self {
        Self {
            time,
            delay,
            reliability,
            matches: MatchGenerator::default(),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn with_matches(mut self, matches: MatchGenerator) -> Self {
        self.matches = matches;
        self
    }

    /// Number of queries started through this instance.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    async fn run_query(&self, term: &SearchTerm) -> Result<QueryResult, QueryFailure> {
        let call = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(call, term = %term, "simulated query started");

        self.delay.delay(self.time.as_ref()).await;

        if let Err(failure) = self.reliability.check() {
            debug!(call, term = %term, error = %failure, "simulated query failed");
            return Err(failure);
        }
        Ok(QueryResult::new(term.clone(), self.matches.generate(term)))
    }
}

impl QueryService for InMemoryQueryService {
    fn query<'a>(
        &'a self,
        term: &'a SearchTerm,
    ) -> BoxFuture<'a, Result<QueryResult, QueryFailure>> {
        Box::pin(self.run_query(term))
    }
}
