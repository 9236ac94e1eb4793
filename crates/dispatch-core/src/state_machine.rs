use crate::{
    error::DispatchError,
    types::{DispatchState, PipelineEvent, SearchTerm},
};

/// The single query currently eligible for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveQuery {
    pub generation: u64,
    pub term: SearchTerm,
}

/// Result of accepting an input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub generation: u64,
    /// Query that was in flight and must now be cancelled.
    pub superseded: Option<ActiveQuery>,
    pub events: Vec<PipelineEvent>,
}

/// Latest-wins dispatch lifecycle.
///
/// Every accepted input gets a fresh generation; only the newest generation
/// may move on to delivery.
#[derive(Debug, Clone)]
pub struct DispatchStateMachine {
    state: DispatchState,
    next_generation: u64,
    active: Option<ActiveQuery>,
}

impl Default for DispatchStateMachine {
    fn default() -> Self {
        Self {
            state: DispatchState::Idle,
            next_generation: 0,
            active: None,
        }
    }
}

impl DispatchStateMachine {
    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn active(&self) -> Option<&ActiveQuery> {
        self.active.as_ref()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// Accept an input event. Allowed in every state.
    pub fn accept(&mut self, term: SearchTerm) -> Accepted {
        let superseded = self.active.take();
        let generation = self.next_generation;
        self.next_generation += 1;

        let mut events = Vec::with_capacity(3);
        if let Some(previous) = &superseded {
            events.push(PipelineEvent::QuerySuperseded {
                generation: previous.generation,
                term: previous.term.clone(),
            });
        }
        events.push(self.transition(DispatchState::Dispatching));
        events.push(PipelineEvent::QueryDispatched {
            generation,
            term: term.clone(),
        });

        self.active = Some(ActiveQuery { generation, term });
        Accepted {
            generation,
            superseded,
            events,
        }
    }

    pub fn on_started(&mut self, generation: u64) -> Result<Vec<PipelineEvent>, DispatchError> {
        self.require(generation, DispatchState::Dispatching, "await_result")?;
        Ok(vec![self.transition(DispatchState::AwaitingResult)])
    }

    pub fn begin_delivery(&mut self, generation: u64) -> Result<Vec<PipelineEvent>, DispatchError> {
        self.require(generation, DispatchState::AwaitingResult, "deliver")?;
        Ok(vec![self.transition(DispatchState::Delivering)])
    }

    pub fn finish_delivery(
        &mut self,
        generation: u64,
    ) -> Result<Vec<PipelineEvent>, DispatchError> {
        self.require(generation, DispatchState::Delivering, "finish_delivery")?;
        self.active = None;
        Ok(vec![self.transition(DispatchState::Idle)])
    }

    fn require(
        &self,
        generation: u64,
        expected: DispatchState,
        action: &'static str,
    ) -> Result<(), DispatchError> {
        if self.state != expected || !self.is_current(generation) {
            return Err(DispatchError::InvalidTransition {
                state: self.state,
                action,
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: DispatchState) -> PipelineEvent {
        self.state = next;
        PipelineEvent::StateChanged { state: next }
    }
}
