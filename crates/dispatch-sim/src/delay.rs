use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dispatch_core::{ConfigError, TimeSource};

/// Artificial latency applied before each simulated query.
#[derive(Debug)]
pub enum DelayStrategy {
    /// Yield to the scheduler without waiting.
    None,
    /// Cycle through a fixed delay sequence.
    RoundRobin(RoundRobinDelay),
}

impl DelayStrategy {
    pub fn none() -> Self {
        Self::None
    }

    pub fn round_robin(delays: impl IntoIterator<Item = Duration>) -> Result<Self, ConfigError> {
        RoundRobinDelay::new(delays).map(Self::RoundRobin)
    }

    /// Apply this call's delay on `time`.
    pub async fn delay(&self, time: &dyn TimeSource) {
        match self {
            Self::None => tokio::task::yield_now().await,
            Self::RoundRobin(round_robin) => time.sleep(round_robin.next_delay()).await,
        }
    }
}

/// Round-robin delay sequence.
///
/// The call counter lives as long as the strategy and is shared by every
/// caller: the Nth call overall waits `delays[N % len]`, whatever its term.
#[derive(Debug)]
pub struct RoundRobinDelay {
    delays: Vec<Duration>,
    calls: AtomicU64,
}

impl RoundRobinDelay {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Result<Self, ConfigError> {
        let delays: Vec<Duration> = delays.into_iter().collect();
        if delays.is_empty() {
            return Err(ConfigError::invalid(
                "delays",
                "[]",
                "round-robin sequence must contain at least one delay",
            ));
        }
        Ok(Self {
            delays,
            calls: AtomicU64::new(0),
        })
    }

    /// Claim the next slot in the sequence.
    pub fn next_delay(&self) -> Duration {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = (call % self.delays.len() as u64) as usize;
        self.delays.get(index).copied().unwrap_or_default()
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}
