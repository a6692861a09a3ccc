use serde::{Deserialize, Serialize};
use statig::prelude::*;

use super::types::FailureReason;

/// Phase of an admitted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    Spawning,
    Running,
    Validating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseEvent {
    Started,
    CompletionReported,
    ValidationPassed,
    RetryRequested,
    Fail(FailureReason),
}

pub type PhaseMachine = statig::blocking::StateMachine<RunLifecycle>;

/// Fresh machine in the spawning phase
pub fn phase_machine(agent_id: &str) -> PhaseMachine {
    RunLifecycle::new(agent_id).state_machine()
}

/// Per-run phase machine: spawning → running → validating → completed/failed,
/// with validating → running on a retry
pub struct RunLifecycle {
    agent_id: String,
    phase: RunPhase,
    failure: Option<FailureReason>,
}

impl RunLifecycle {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            phase: RunPhase::Spawning,
            failure: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, RunPhase::Completed | RunPhase::Failed)
    }

    fn enter(&mut self, phase: RunPhase) {
        tracing::debug!(
            agent_id = %self.agent_id,
            from = ?self.phase,
            to = ?phase,
            "Run phase changed"
        );
        self.phase = phase;
    }

    fn fail(&mut self, reason: &FailureReason) -> Outcome<State> {
        self.failure = Some(reason.clone());
        self.enter(RunPhase::Failed);
        Transition(State::failed())
    }
}

#[state_machine(initial = "State::spawning()")]
impl RunLifecycle {
    #[state]
    fn spawning(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::Started => {
                self.enter(RunPhase::Running);
                Transition(State::running())
            }
            PhaseEvent::Fail(reason) => self.fail(reason),
            _ => Handled,
        }
    }

    #[state]
    fn running(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::CompletionReported => {
                self.enter(RunPhase::Validating);
                Transition(State::validating())
            }
            PhaseEvent::Fail(reason) => self.fail(reason),
            _ => Handled,
        }
    }

    #[state]
    fn validating(&mut self, event: &PhaseEvent) -> Outcome<State> {
        match event {
            PhaseEvent::ValidationPassed => {
                self.enter(RunPhase::Completed);
                Transition(State::completed())
            }
            PhaseEvent::RetryRequested => {
                self.enter(RunPhase::Running);
                Transition(State::running())
            }
            PhaseEvent::Fail(reason) => self.fail(reason),
            _ => Handled,
        }
    }

    #[state]
    fn completed(&mut self, event: &PhaseEvent) -> Outcome<State> {
        tracing::debug!(agent_id = %self.agent_id, ?event, "Run already completed");
        Handled
    }

    #[state]
    fn failed(&mut self, event: &PhaseEvent) -> Outcome<State> {
        tracing::debug!(agent_id = %self.agent_id, ?event, "Run already failed");
        Handled
    }
}
