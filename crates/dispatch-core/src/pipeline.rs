//! Latest-wins query pipeline.
//!
//! Each input event starts one query execution: the backend call is bounded
//! by a timeout, the timeout-bounded call is wrapped in retry-with-backoff,
//! and the retried call runs in its own task under a cancellation token. A
//! newer input event cancels the previous token before the next execution
//! starts, so only the newest execution can reach the result channel.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    channel::{PipelineChannelError, PipelineChannels, PipelineEventStream, PipelineReceivers},
    error::{ConfigError, QueryFailure},
    normalization::normalize_outcome,
    retry::{RetryPolicy, RetryWithBackoff},
    service::SharedQueryService,
    state_machine::DispatchStateMachine,
    time::SharedTimeSource,
    timeout::with_timeout,
    types::{PipelineEvent, QueryResult, SearchTerm},
};

/// Default per-attempt query bound.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_INPUT_BUFFER: usize = 64;
const DEFAULT_RESULT_BUFFER: usize = 64;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Construction-time pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    retry: RetryPolicy,
    timeout: Duration,
}

impl PipelineConfig {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid(
                "timeout",
                format!("{timeout:?}"),
                "must be greater than 0",
            ));
        }
        Ok(Self { retry, timeout })
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// Unstarted pipeline: configuration plus its collaborators.
#[derive(Debug, Clone)]
pub struct QueryPipeline {
    config: PipelineConfig,
    service: SharedQueryService,
    time: SharedTimeSource,
}

impl QueryPipeline {
    pub fn new(
        config: PipelineConfig,
        service: SharedQueryService,
        time: SharedTimeSource,
    ) -> Self {
        Self {
            config,
            service,
            time,
        }
    }

    /// Start the dispatch loop on the current tokio runtime.
    pub fn spawn(self) -> PipelineHandle {
        self.spawn_with_buffers(
            DEFAULT_INPUT_BUFFER,
            DEFAULT_RESULT_BUFFER,
            DEFAULT_EVENT_BUFFER,
        )
    }

    pub fn spawn_with_buffers(
        self,
        input_buffer: usize,
        result_buffer: usize,
        event_buffer: usize,
    ) -> PipelineHandle {
        let (channels, receivers, results) =
            PipelineChannels::new(input_buffer, result_buffer, event_buffer);
        let shutdown = CancellationToken::new();

        info!(
            max_attempts = self.config.retry.max_attempts(),
            timeout_ms = self.config.timeout.as_millis() as u64,
            "starting query pipeline"
        );

        let dispatcher = Dispatcher {
            retry: RetryWithBackoff::new(self.config.retry.clone(), Arc::clone(&self.time)),
            config: self.config,
            service: self.service,
            time: self.time,
            events: channels.event_sender(),
            machine: DispatchStateMachine::default(),
            in_flight: None,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(dispatcher.run(receivers));

        PipelineHandle {
            channels,
            results,
            shutdown,
            task,
        }
    }
}

/// Presentation-side handle to a running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    channels: PipelineChannels,
    results: mpsc::Receiver<QueryResult>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Submit the full current text of the input box.
    pub async fn submit(&self, term: impl Into<SearchTerm>) -> Result<(), PipelineChannelError> {
        self.channels.send_input(term.into()).await
    }

    /// Clone the input sender. Outstanding clones keep the input stream open.
    pub fn input_sender(&self) -> mpsc::Sender<SearchTerm> {
        self.channels.input_sender()
    }

    pub fn subscribe(&self) -> PipelineEventStream {
        self.channels.subscribe()
    }

    /// Wait for the next delivered result. `None` once the pipeline stopped.
    pub async fn next_result(&mut self) -> Option<QueryResult> {
        self.results.recv().await
    }

    pub fn try_next_result(&mut self) -> Option<QueryResult> {
        self.results.try_recv().ok()
    }

    /// End the input stream, let the in-flight query finish, and return every
    /// result not yet taken.
    pub async fn close(self) -> Vec<QueryResult> {
        let Self {
            channels,
            mut results,
            task,
            ..
        } = self;
        drop(channels);

        let mut remaining = Vec::new();
        while let Some(result) = results.recv().await {
            remaining.push(result);
        }
        if let Err(err) = task.await {
            warn!(error = %err, "dispatch loop task failed");
        }
        remaining
    }

    /// Cancel the in-flight query and stop the dispatch loop immediately.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "dispatch loop task failed");
        }
    }
}

struct Completion {
    generation: u64,
    term: SearchTerm,
    outcome: Result<QueryResult, QueryFailure>,
}

struct Dispatcher {
    config: PipelineConfig,
    service: SharedQueryService,
    time: SharedTimeSource,
    retry: RetryWithBackoff,
    events: broadcast::Sender<PipelineEvent>,
    machine: DispatchStateMachine,
    in_flight: Option<CancellationToken>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self, receivers: PipelineReceivers) {
        let PipelineReceivers {
            mut inputs,
            results_tx,
        } = receivers;
        let (completion_tx, mut completions) = mpsc::unbounded_channel::<Completion>();
        let shutdown = self.shutdown.clone();
        let mut inputs_open = true;

        loop {
            if !inputs_open && self.machine.active().is_none() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("pipeline shutdown requested");
                    break;
                }
                input = inputs.recv(), if inputs_open => match input {
                    Some(term) => self.dispatch(term, &completion_tx),
                    None => {
                        debug!("input stream closed; draining in-flight query");
                        inputs_open = false;
                    }
                },
                Some(completion) = completions.recv() => {
                    if !self.deliver(completion, &results_tx).await {
                        break;
                    }
                }
            }
        }

        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
        info!("query pipeline stopped");
    }

    fn dispatch(&mut self, term: SearchTerm, completion_tx: &mpsc::UnboundedSender<Completion>) {
        let accepted = self.machine.accept(term.clone());
        if let Some(previous) = &accepted.superseded {
            if let Some(token) = self.in_flight.take() {
                token.cancel();
            }
            debug!(
                generation = previous.generation,
                term = %previous.term,
                "cancelled superseded query"
            );
        }
        self.emit_all(accepted.events);

        let generation = accepted.generation;
        let token = self.shutdown.child_token();
        self.in_flight = Some(token.clone());
        debug!(generation, term = %term, "dispatching query");

        let execution = QueryExecution {
            term: term.clone(),
            service: Arc::clone(&self.service),
            time: Arc::clone(&self.time),
            retry: self.retry.clone(),
            timeout: self.config.timeout,
            events: self.events.clone(),
        };
        let completion_tx = completion_tx.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(QueryFailure::Cancelled),
                outcome = execution.run() => outcome,
            };
            if matches!(outcome, Err(QueryFailure::Cancelled)) {
                trace!(generation, "execution cancelled");
                return;
            }
            let _ = completion_tx.send(Completion {
                generation,
                term,
                outcome,
            });
        });

        match self.machine.on_started(generation) {
            Ok(events) => self.emit_all(events),
            Err(err) => warn!(code = err.code(), error = %err, "dispatch transition rejected"),
        }
    }

    /// Hand a completion downstream. Returns `false` once nobody listens.
    async fn deliver(
        &mut self,
        completion: Completion,
        results_tx: &mpsc::Sender<QueryResult>,
    ) -> bool {
        let Completion {
            generation,
            term,
            outcome,
        } = completion;

        if !self.machine.is_current(generation) {
            debug!(generation, term = %term, "discarding stale completion");
            return true;
        }
        let Some(delivery) = normalize_outcome(&term, outcome) else {
            return true;
        };

        match self.machine.begin_delivery(generation) {
            Ok(events) => self.emit_all(events),
            Err(err) => {
                warn!(code = err.code(), error = %err, "delivery transition rejected");
                return true;
            }
        }
        self.in_flight = None;

        if delivery.placeholder {
            warn!(generation, term = %term, "delivering failure placeholder");
        } else {
            debug!(
                generation,
                term = %term,
                matches = delivery.result.matches.len(),
                "delivering result"
            );
        }

        let placeholder = delivery.placeholder;
        if results_tx.send(delivery.result).await.is_err() {
            info!("result receiver dropped; stopping pipeline");
            return false;
        }
        self.emit(PipelineEvent::ResultDelivered {
            generation,
            term,
            placeholder,
        });

        match self.machine.finish_delivery(generation) {
            Ok(events) => self.emit_all(events),
            Err(err) => warn!(code = err.code(), error = %err, "finish transition rejected"),
        }
        true
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<PipelineEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

/// One input event's query: timeout inside, retry outside.
struct QueryExecution {
    term: SearchTerm,
    service: SharedQueryService,
    time: SharedTimeSource,
    retry: RetryWithBackoff,
    timeout: Duration,
    events: broadcast::Sender<PipelineEvent>,
}

impl QueryExecution {
    async fn run(self) -> Result<QueryResult, QueryFailure> {
        let Self {
            term,
            service,
            time,
            retry,
            timeout,
            events,
        } = self;

        retry
            .run_with_callback(
                |attempt| {
                    let service = Arc::clone(&service);
                    let time = Arc::clone(&time);
                    let term = term.clone();
                    async move {
                        trace!(attempt, term = %term, "invoking query service");
                        with_timeout(time.as_ref(), timeout, service.query(&term)).await
                    }
                },
                |attempt, _, delay| {
                    let _ = events.send(PipelineEvent::RetryScheduled {
                        term: term.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        retry::BackoffPlan,
        service::QueryService,
        time::{TimeSource, TokioTimeSource, VirtualTimeSource},
        types::DispatchState,
    };

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// Answers after `latency`, failing while `failures_left` is non-zero.
    #[derive(Debug)]
    struct ScriptedService {
        time: SharedTimeSource,
        latency: Duration,
        failures_left: AtomicU32,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedService {
        fn new(time: SharedTimeSource, latency: Duration, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                time,
                latency,
                failures_left: AtomicU32::new(failures),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls_for(&self, term: &str) -> usize {
            self.calls
                .lock()
                .expect("calls lock")
                .iter()
                .filter(|called| called.as_str() == term)
                .count()
        }
    }

    impl QueryService for ScriptedService {
        fn query<'a>(
            &'a self,
            term: &'a SearchTerm,
        ) -> BoxFuture<'a, Result<QueryResult, QueryFailure>> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .expect("calls lock")
                    .push(term.to_string());
                self.time.sleep(self.latency).await;
                let failing = self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                        left.checked_sub(1)
                    })
                    .is_ok();
                if failing {
                    return Err(QueryFailure::execution("scripted failure"));
                }
                Ok(QueryResult::new(term.clone(), vec![format!("{term}!")]))
            })
        }
    }

    fn config(attempts: u32, backoff: Duration, timeout: Duration) -> PipelineConfig {
        let plan = BackoffPlan::sequence([backoff]).expect("plan should be valid");
        let retry = RetryPolicy::new(attempts, plan).expect("policy should be valid");
        PipelineConfig::new(retry, timeout).expect("config should be valid")
    }

    fn spawn_pipeline(
        clock: &VirtualTimeSource,
        service: &Arc<ScriptedService>,
        config: PipelineConfig,
    ) -> PipelineHandle {
        let service = Arc::clone(service) as SharedQueryService;
        QueryPipeline::new(config, service, clock.shared()).spawn()
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = PipelineConfig::new(RetryPolicy::default(), Duration::ZERO)
            .expect_err("zero timeout must fail");
        assert!(matches!(err, ConfigError::InvalidValue { key: "timeout", .. }));
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.retry().max_attempts(), 3);
        assert_eq!(config.timeout(), secs(2));
    }

    #[tokio::test]
    async fn delivers_result_for_single_input() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), secs(1), 0);
        let mut handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));

        handle.submit("rust").await.expect("submit should work");
        clock.advance(secs(1)).await;

        let result = handle.try_next_result().expect("result should be delivered");
        assert_eq!(result.term.as_str(), "rust");
        assert_eq!(result.matches, vec!["rust!".to_owned()]);
        assert!(handle.close().await.is_empty());
    }

    #[tokio::test]
    async fn rapid_inputs_deliver_only_the_latest() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), secs(1), 0);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));

        for term in ["r", "ru", "rus"] {
            handle.submit(term).await.expect("submit should work");
        }
        clock.advance(secs(10)).await;

        let results = handle.close().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].term.as_str(), "rus");
    }

    #[tokio::test]
    async fn input_arriving_mid_flight_cancels_the_previous_query() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), secs(1), 0);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));

        handle.submit("r").await.expect("submit should work");
        clock.advance(Duration::from_millis(500)).await;
        assert_eq!(service.calls_for("r"), 1);

        handle.submit("ru").await.expect("submit should work");
        clock.advance(secs(5)).await;

        let results = handle.close().await;
        let terms: Vec<&str> = results.iter().map(|r| r.term.as_str()).collect();
        assert_eq!(terms, vec!["ru"]);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test]
    async fn results_resolved_before_next_input_are_delivered_in_order() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), secs(1), 0);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));

        handle.submit("a").await.expect("submit should work");
        clock.advance(secs(2)).await;
        handle.submit("ab").await.expect("submit should work");
        clock.advance(secs(2)).await;

        let results = handle.close().await;
        let terms: Vec<&str> = results.iter().map(|r| r.term.as_str()).collect();
        assert_eq!(terms, vec!["a", "ab"]);
    }

    #[tokio::test]
    async fn slow_query_renders_timed_out_placeholder() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), secs(5), 0);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));

        handle.submit("slow").await.expect("submit should work");
        clock.advance(secs(10)).await;

        let results = handle.close().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].matches, vec!["Query(slow) timed out".to_owned()]);
        assert_eq!(service.calls_for("slow"), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_render_failed_placeholder() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), Duration::from_millis(100), u32::MAX);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));

        handle.submit("down").await.expect("submit should work");
        clock.advance(secs(10)).await;

        let results = handle.close().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].matches, vec!["Query(down) failed".to_owned()]);
        assert_eq!(service.calls_for("down"), 3);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), Duration::from_millis(100), 2);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));
        let mut events = handle.subscribe();

        handle.submit("flaky").await.expect("submit should work");
        clock.advance(secs(10)).await;

        let results = handle.close().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].matches, vec!["flaky!".to_owned()]);

        let mut retries = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::RetryScheduled { attempt, .. } = event {
                retries.push(attempt);
            }
        }
        assert_eq!(retries, vec![0, 1]);
    }

    #[tokio::test]
    async fn superseding_during_backoff_releases_the_wait() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), Duration::from_millis(100), 1);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(10), secs(2)));

        handle.submit("a").await.expect("submit should work");
        clock.advance(secs(1)).await;
        assert_eq!(service.calls_for("a"), 1);
        assert_eq!(clock.pending_timers(), 1, "backoff wait should be pending");

        handle.submit("ab").await.expect("submit should work");
        clock.advance(secs(60)).await;

        assert_eq!(service.calls_for("a"), 1, "superseded query must not retry");
        let results = handle.close().await;
        let terms: Vec<&str> = results.iter().map(|r| r.term.as_str()).collect();
        assert_eq!(terms, vec!["ab"]);
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test]
    async fn emits_lifecycle_events_for_one_query() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), secs(1), 0);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(2)));
        let mut events = handle.subscribe();

        handle.submit("r").await.expect("submit should work");
        clock.advance(secs(2)).await;
        handle.close().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                PipelineEvent::StateChanged {
                    state: DispatchState::Dispatching
                },
                PipelineEvent::QueryDispatched {
                    generation: 0,
                    term: SearchTerm::from("r"),
                },
                PipelineEvent::StateChanged {
                    state: DispatchState::AwaitingResult
                },
                PipelineEvent::StateChanged {
                    state: DispatchState::Delivering
                },
                PipelineEvent::ResultDelivered {
                    generation: 0,
                    term: SearchTerm::from("r"),
                    placeholder: false,
                },
                PipelineEvent::StateChanged {
                    state: DispatchState::Idle
                },
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_query() {
        let clock = VirtualTimeSource::new();
        let service = ScriptedService::new(clock.shared(), secs(5), 0);
        let handle = spawn_pipeline(&clock, &service, config(3, secs(1), secs(10)));

        handle.submit("r").await.expect("submit should work");
        clock.advance(secs(1)).await;
        assert!(clock.pending_timers() > 0);

        handle.shutdown().await;
        clock.advance(Duration::ZERO).await;
        assert_eq!(clock.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_against_the_tokio_clock() {
        let time = TokioTimeSource::shared();
        let service = ScriptedService::new(Arc::clone(&time), secs(1), 1);
        let mut handle = QueryPipeline::new(
            config(3, secs(1), secs(2)),
            Arc::clone(&service) as SharedQueryService,
            Arc::clone(&time),
        )
        .spawn();

        handle.submit("tokio").await.expect("submit should work");
        let result = handle.next_result().await.expect("result should arrive");

        assert_eq!(result.matches, vec!["tokio!".to_owned()]);
        assert!(time.now() >= secs(3));
    }
}
