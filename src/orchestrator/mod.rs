//! Lifecycle orchestrator
//!
//! Runs agents against work items under a concurrency ceiling. Requests that
//! do not fit are queued by priority; admitted runs move through
//! spawning → running → validating → completed/failed, with failed
//! validations sent back to the agent up to a retry bound. All ownership
//! goes through the coordination hub, and every terminal run is written to
//! the backlog.

mod actor;
pub mod backlog;
pub mod lifecycle;
pub mod process;
pub mod queue;
pub mod traits;
pub mod types;
pub mod validation;

pub use backlog::JsonBacklogSink;
pub use lifecycle::{RunLifecycle, RunPhase};
pub use process::LocalProcessManager;
pub use queue::PendingQueue;
pub use traits::{
    AgentInstruction, AgentReport, BacklogSink, LifecycleEvent, LifecycleEventHandler,
    LoggingEventHandler, ProcessManager, RunEvent, RunHandle, ValidationReport, Validator,
};
pub use types::{
    FailureReason, OrchestratorSnapshot, QueuedEntry, RunRecord, RunResult, SpawnOutcome,
    SpawnRequest,
};
pub use validation::CommandValidator;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use self::actor::{Command, OrchestratorActor};
use crate::client::CoordinationClient;
use crate::config::SodaHubConfig;
use crate::hub::HubError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Orchestrator is not running")]
    Stopped,

    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
}

/// Runtime knobs, resolved from [`SodaHubConfig`]
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub default_deadline: Duration,
    pub staleness: Duration,
    pub sweep_interval: Duration,
    pub workspace_root: PathBuf,
    /// Identity claimed on the hub
    pub identity: String,
    pub role: String,
    pub project: String,
    pub completion_label: String,
    /// Status a failed run's item falls back to
    pub available_label: String,
}

impl OrchestratorSettings {
    pub fn from_config(config: &SodaHubConfig) -> Self {
        let orchestrator = &config.orchestrator;
        Self {
            max_concurrent: orchestrator.max_concurrent.max(1),
            max_retries: orchestrator.max_retries,
            default_deadline: Duration::from_secs(orchestrator.deadline_seconds),
            staleness: Duration::from_secs(orchestrator.staleness_seconds),
            sweep_interval: Duration::from_secs(orchestrator.sweep_interval_seconds.max(1)),
            workspace_root: orchestrator.workspace_root.clone(),
            identity: orchestrator.identity.clone(),
            role: "orchestrator".to_string(),
            project: orchestrator.project.clone(),
            completion_label: orchestrator.completion_label.clone(),
            available_label: config.hub.vocabulary.available.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&SodaHubConfig::default())
    }
}

/// Everything the orchestrator delegates to
#[derive(Clone)]
pub struct Collaborators {
    pub process_manager: Arc<dyn ProcessManager>,
    pub validator: Arc<dyn Validator>,
    pub backlog: Arc<dyn BacklogSink>,
    pub events: Arc<dyn LifecycleEventHandler>,
}

impl Collaborators {
    pub fn new(
        process_manager: Arc<dyn ProcessManager>,
        validator: Arc<dyn Validator>,
        backlog: Arc<dyn BacklogSink>,
    ) -> Self {
        Self {
            process_manager,
            validator,
            backlog,
            events: Arc::new(LoggingEventHandler),
        }
    }

    pub fn with_event_handler(mut self, events: Arc<dyn LifecycleEventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Local processes, shell validation and a JSON backlog file
    pub fn local(config: &SodaHubConfig) -> Self {
        let orchestrator = &config.orchestrator;
        Self::new(
            Arc::new(LocalProcessManager::new(
                orchestrator.agent_command.clone(),
                Duration::from_secs(orchestrator.termination_grace_seconds),
            )),
            Arc::new(CommandValidator::new(orchestrator.validation_commands.clone())),
            Arc::new(JsonBacklogSink::new(orchestrator.backlog_file.clone())),
        )
    }
}

/// Handle to a running orchestrator
#[derive(Debug, Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
}

impl Orchestrator {
    /// Claim the orchestrator identity on the hub and start the actor
    pub async fn start(
        settings: OrchestratorSettings,
        client: Arc<CoordinationClient>,
        collaborators: Collaborators,
    ) -> Result<(Self, JoinHandle<()>), OrchestratorError> {
        let full_name = client
            .claim_identity(&settings.identity, &settings.role, &settings.project)
            .await?;
        info!(identity = %full_name, "Orchestrator identity claimed");

        let (commands, receiver) = mpsc::unbounded_channel();
        let actor = OrchestratorActor::new(settings, client, collaborators, commands.clone());
        let task = tokio::spawn(actor.run(receiver));
        Ok((Self { commands }, task))
    }

    /// Admit the request now or queue it by priority
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome, OrchestratorError> {
        let (reply, outcome) = oneshot::channel();
        self.send(Command::Spawn { request, reply })?;
        outcome.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Out-of-band completion report for a running agent.
    /// Returns false when the agent is unknown or not running.
    pub async fn report_completion(&self, agent_id: &str) -> Result<bool, OrchestratorError> {
        let (reply, accepted) = oneshot::channel();
        self.send(Command::ReportCompletion {
            agent_id: agent_id.to_string(),
            reply,
        })?;
        accepted.await.map_err(|_| OrchestratorError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<OrchestratorSnapshot, OrchestratorError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        snapshot.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Drop the queue, fail active runs, release their claims and stop
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let (done, finished) = oneshot::channel();
        self.send(Command::Shutdown { done })?;
        finished.await.map_err(|_| OrchestratorError::Stopped)
    }

    fn send(&self, command: Command) -> Result<(), OrchestratorError> {
        self.commands
            .send(command)
            .map_err(|_| OrchestratorError::Stopped)
    }
}
