//! Time sources used by every suspension point in the pipeline.
//!
//! Backoff waits, simulated backend latency and the query timeout all sleep
//! through a [`TimeSource`]. Production wiring uses [`TokioTimeSource`];
//! tests substitute [`VirtualTimeSource`], whose clock only moves when
//! [`VirtualTimeSource::advance`] is called.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
    time::Duration,
};

use futures::future::BoxFuture;
use tracing::trace;

/// Scheduler-yield rounds run between virtual timer firings so that woken
/// tasks can register follow-up timers before the clock moves on.
const SETTLE_ROUNDS: usize = 64;

/// Abstraction over "wait for duration D, then proceed".
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Time elapsed since this source was created.
    fn now(&self) -> Duration;

    /// Suspend for `duration`. Dropping the future cancels the wait.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Time source shared by every component of one pipeline.
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// Wall-clock time source backed by the tokio timer.
///
/// Under `tokio::time::pause` this follows tokio's paused clock.
#[derive(Debug, Clone, Copy)]
pub struct TokioTimeSource {
    origin: tokio::time::Instant,
}

impl TokioTimeSource {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }

    pub fn shared() -> SharedTimeSource {
        Arc::new(Self::new())
    }
}

impl Default for TokioTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for TokioTimeSource {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Default)]
struct VirtualClock {
    now: Duration,
    next_timer_id: u64,
    timers: BTreeMap<(Duration, u64), Waker>,
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same clock. Sleeps registered against it complete only
/// when [`advance`](Self::advance) moves virtual time past their deadline;
/// timers fire in deadline order, each at its exact deadline.
#[derive(Debug, Clone, Default)]
pub struct VirtualTimeSource {
    clock: Arc<Mutex<VirtualClock>>,
}

impl VirtualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share this clock as a trait object.
    pub fn shared(&self) -> SharedTimeSource {
        Arc::new(self.clone())
    }

    /// Number of sleeps that are registered and have not fired yet.
    pub fn pending_timers(&self) -> usize {
        lock(&self.clock).timers.len()
    }

    /// Move virtual time forward by `by`, firing every timer that falls due.
    ///
    /// Runnable tasks get a chance to run before and after each firing, so
    /// chains of sleeps within the window resolve in one call.
    pub async fn advance(&self, by: Duration) {
        let target = lock(&self.clock).now.saturating_add(by);

        loop {
            settle().await;

            let due = {
                let mut clock = lock(&self.clock);
                let Some(&(deadline, _)) = clock.timers.keys().next() else {
                    break;
                };
                if deadline > target {
                    break;
                }
                clock.now = clock.now.max(deadline);
                let later = clock.timers.split_off(&(deadline, u64::MAX));
                std::mem::replace(&mut clock.timers, later)
            };

            trace!(fired = due.len(), "virtual timers due");
            for waker in due.into_values() {
                waker.wake();
            }
        }

        {
            let mut clock = lock(&self.clock);
            clock.now = clock.now.max(target);
        }
        settle().await;
    }
}

impl TimeSource for VirtualTimeSource {
    fn now(&self) -> Duration {
        lock(&self.clock).now
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let (deadline, id) = {
            let mut clock = lock(&self.clock);
            let id = clock.next_timer_id;
            clock.next_timer_id += 1;
            (clock.now.saturating_add(duration), id)
        };

        Box::pin(VirtualSleep {
            clock: Arc::clone(&self.clock),
            deadline,
            id,
        })
    }
}

struct VirtualSleep {
    clock: Arc<Mutex<VirtualClock>>,
    deadline: Duration,
    id: u64,
}

impl Future for VirtualSleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut clock = lock(&self.clock);
        let key = (self.deadline, self.id);
        if clock.now >= self.deadline {
            clock.timers.remove(&key);
            return Poll::Ready(());
        }
        clock.timers.insert(key, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for VirtualSleep {
    fn drop(&mut self) {
        lock(&self.clock).timers.remove(&(self.deadline, self.id));
    }
}

fn lock(clock: &Mutex<VirtualClock>) -> MutexGuard<'_, VirtualClock> {
    clock.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn settle() {
    for _ in 0..SETTLE_ROUNDS {
        tokio::task::yield_now().await;
    }
}
