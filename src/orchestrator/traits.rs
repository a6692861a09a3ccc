//! Collaborators consumed by the orchestrator
//!
//! Process management, validation and backlog bookkeeping sit behind traits
//! so the orchestrator can be driven by fakes in tests and by the local
//! implementations in `process`, `validation` and `backlog` in production.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::types::RunResult;
use crate::hub::NewWorkItem;
use crate::priority::Priority;

/// Structured message an agent sends about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum AgentReport {
    Progress {
        percent: u8,
        #[serde(default)]
        notes: Option<String>,
    },
    Completed {
        #[serde(default)]
        summary: Option<String>,
    },
}

/// What a running agent tells the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Unstructured output line
    Output(String),
    Report(AgentReport),
    Exited { code: Option<i32> },
}

/// What the orchestrator tells a running agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "instruction", rename_all = "snake_case")]
pub enum AgentInstruction {
    Retry { attempt: u32, issues: Vec<String> },
    Ping,
    Stop,
}

/// Channels to one spawned agent
#[derive(Debug)]
pub struct RunHandle {
    pub events: mpsc::Receiver<RunEvent>,
    pub instructions: mpsc::Sender<AgentInstruction>,
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn spawn(&self, agent_id: &str, workspace: &Path, task: &str) -> anyhow::Result<RunHandle>;
    /// Graceful termination first, forced after the grace window
    async fn terminate(&self, agent_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn pass() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
        }
    }

    pub fn fail(issues: Vec<String>) -> Self {
        Self {
            passed: false,
            issues,
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, workspace: &Path) -> ValidationReport;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait BacklogSink: Send + Sync {
    async fn set_status(
        &self,
        item: &NewWorkItem,
        status: &str,
        result: &RunResult,
    ) -> anyhow::Result<()>;
}

/// Orchestrator lifecycle events for external notification
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Admitted {
        agent_id: String,
        item_id: String,
        priority: Priority,
    },
    Queued {
        item_id: String,
        position: usize,
        priority: Priority,
    },
    Running {
        agent_id: String,
    },
    Validating {
        agent_id: String,
        attempt: u32,
    },
    RetryRequested {
        agent_id: String,
        attempt: u32,
        issues: Vec<String>,
    },
    Pinged {
        agent_id: String,
        idle_seconds: u64,
    },
    Completed {
        agent_id: String,
        item_id: String,
        runtime_seconds: u64,
    },
    Failed {
        agent_id: String,
        item_id: String,
        reason: String,
    },
}

/// Lifecycle event handler trait
pub trait LifecycleEventHandler: Send + Sync {
    fn handle_event(&self, event: LifecycleEvent);
}

/// Default logging event handler
pub struct LoggingEventHandler;

impl LifecycleEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Admitted {
                agent_id,
                item_id,
                priority,
            } => {
                info!(
                    agent_id = %agent_id,
                    item_id = %item_id,
                    priority = %priority,
                    "Spawn request admitted"
                );
            }
            LifecycleEvent::Queued {
                item_id,
                position,
                priority,
            } => {
                info!(
                    item_id = %item_id,
                    position = position,
                    priority = %priority,
                    "Spawn request queued"
                );
            }
            LifecycleEvent::Running { agent_id } => {
                info!(agent_id = %agent_id, "Agent running");
            }
            LifecycleEvent::Validating { agent_id, attempt } => {
                info!(agent_id = %agent_id, attempt = attempt, "Validating agent output");
            }
            LifecycleEvent::RetryRequested {
                agent_id,
                attempt,
                issues,
            } => {
                warn!(
                    agent_id = %agent_id,
                    attempt = attempt,
                    issues = ?issues,
                    "Validation failed, agent asked to retry"
                );
            }
            LifecycleEvent::Pinged {
                agent_id,
                idle_seconds,
            } => {
                debug!(agent_id = %agent_id, idle_seconds = idle_seconds, "Pinged idle agent");
            }
            LifecycleEvent::Completed {
                agent_id,
                item_id,
                runtime_seconds,
            } => {
                info!(
                    agent_id = %agent_id,
                    item_id = %item_id,
                    runtime_seconds = runtime_seconds,
                    "Agent run completed successfully"
                );
            }
            LifecycleEvent::Failed {
                agent_id,
                item_id,
                reason,
            } => {
                error!(
                    agent_id = %agent_id,
                    item_id = %item_id,
                    reason = %reason,
                    "Agent run failed"
                );
            }
        }
    }
}
