use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::{PipelineEvent, QueryResult, SearchTerm};

/// Broadcast lifecycle stream used by pipeline observers.
pub type PipelineEventStream = broadcast::Receiver<PipelineEvent>;

/// Errors returned by pipeline channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineChannelError {
    /// The dispatch loop is no longer receiving input events.
    #[error("input channel is closed")]
    InputChannelClosed,
}

/// Channel ends shared by the presentation side and the dispatch loop.
///
/// Input events and results use bounded `mpsc` queues so no result is ever
/// dropped; lifecycle events are best-effort `broadcast`.
#[derive(Clone, Debug)]
pub struct PipelineChannels {
    input_tx: mpsc::Sender<SearchTerm>,
    event_tx: broadcast::Sender<PipelineEvent>,
}

/// Receiving ends handed to the dispatch loop.
#[derive(Debug)]
pub struct PipelineReceivers {
    pub inputs: mpsc::Receiver<SearchTerm>,
    pub results_tx: mpsc::Sender<QueryResult>,
}

impl PipelineChannels {
    /// Create a channel set, returning the dispatch-side ends and the result
    /// receiver for the presentation layer.
    pub fn new(
        input_buffer: usize,
        result_buffer: usize,
        event_buffer: usize,
    ) -> (Self, PipelineReceivers, mpsc::Receiver<QueryResult>) {
        let (input_tx, inputs) = mpsc::channel(input_buffer.max(1));
        let (results_tx, results_rx) = mpsc::channel(result_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self { input_tx, event_tx },
            PipelineReceivers {
                inputs,
                results_tx,
            },
            results_rx,
        )
    }

    /// Clone the input sender.
    pub fn input_sender(&self) -> mpsc::Sender<SearchTerm> {
        self.input_tx.clone()
    }

    /// Clone the lifecycle event sender.
    pub fn event_sender(&self) -> broadcast::Sender<PipelineEvent> {
        self.event_tx.clone()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> PipelineEventStream {
        self.event_tx.subscribe()
    }

    /// Submit one input-changed event.
    pub async fn send_input(&self, term: SearchTerm) -> Result<(), PipelineChannelError> {
        self.input_tx
            .send(term)
            .await
            .map_err(|_| PipelineChannelError::InputChannelClosed)
    }

    /// Emit a lifecycle event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.event_tx.send(event);
    }
}
