// Records and request/response types of the lifecycle orchestrator

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lifecycle::RunPhase;
use crate::hub::NewWorkItem;
use crate::priority::Priority;

/// A request to run an agent against one work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub work_item: NewWorkItem,
    #[serde(default)]
    pub priority: Priority,
    /// Overrides the configured run deadline
    #[serde(default, with = "optional_secs")]
    pub deadline: Option<Duration>,
    /// Instructions handed to the agent process
    pub task: String,
    /// Defaults to `<workspace_root>/<agent id>`
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl SpawnRequest {
    pub fn new(work_item: NewWorkItem, task: impl Into<String>) -> Self {
        Self {
            work_item,
            priority: Priority::default(),
            deadline: None,
            task: task.into(),
            workspace: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = Some(workspace.into());
        self
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Answer to a spawn request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpawnOutcome {
    Admitted { agent_id: String },
    Queued { position: usize, priority: Priority },
}

/// Why a run ended in the failed phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum FailureReason {
    Timeout,
    ValidationExhausted,
    ExitedWithoutCompletion,
    ProcessError { code: Option<i32> },
    SpawnError { message: String },
    ClaimConflict { message: String },
    Shutdown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::ValidationExhausted => write!(f, "validation-exhausted"),
            FailureReason::ExitedWithoutCompletion => write!(f, "exited-without-completion"),
            FailureReason::ProcessError { .. } => write!(f, "process-error"),
            FailureReason::SpawnError { .. } => write!(f, "spawn-error"),
            FailureReason::ClaimConflict { .. } => write!(f, "claim-conflict"),
            FailureReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Observable state of one admitted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub agent_id: String,
    pub work_item: NewWorkItem,
    pub priority: Priority,
    pub phase: RunPhase,
    pub retry_count: u32,
    pub errors: Vec<String>,
    pub workspace: PathBuf,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
}

/// What the backlog sink is told when a run ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub agent_id: String,
    pub succeeded: bool,
    pub reason: Option<String>,
    pub retries: u32,
    pub issues: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            succeeded: record.phase == RunPhase::Completed,
            reason: record.failure_reason.as_ref().map(ToString::to_string),
            retries: record.retry_count,
            issues: record.errors.clone(),
            finished_at: record.end_time.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEntry {
    pub position: usize,
    pub priority: Priority,
    pub item_id: String,
}

/// Point-in-time view of the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorSnapshot {
    pub active: Vec<RunRecord>,
    pub queued: Vec<QueuedEntry>,
    pub archived: Vec<RunRecord>,
}

impl OrchestratorSnapshot {
    pub fn find(&self, agent_id: &str) -> Option<&RunRecord> {
        self.active
            .iter()
            .chain(self.archived.iter())
            .find(|record| record.agent_id == agent_id)
    }

    pub fn archived_for_item(&self, item_id: &str) -> Vec<&RunRecord> {
        self.archived
            .iter()
            .filter(|record| record.work_item.id == item_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_strings() {
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
        assert_eq!(
            FailureReason::ProcessError { code: Some(2) }.to_string(),
            "process-error"
        );
        let json = serde_json::to_value(FailureReason::ValidationExhausted).unwrap();
        assert_eq!(json["reason"], "validation-exhausted");
    }

    #[test]
    fn test_spawn_request_from_toml() {
        let request: SpawnRequest = toml::from_str(
            r#"
task = "Implement the parser"
priority = "high"
deadline = 600

[work_item]
id = "4.2"
epic_id = "4"
"#,
        )
        .unwrap();
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.deadline, Some(Duration::from_secs(600)));
        assert_eq!(request.work_item.id, "4.2");
        assert!(request.workspace.is_none());
    }

    #[test]
    fn test_spawn_request_builders() {
        let request = SpawnRequest::new(NewWorkItem::new("4.3", "4"), "Write docs")
            .with_priority(Priority::Low)
            .with_deadline(Duration::from_secs(30))
            .with_workspace("/tmp/agents/docs");
        assert_eq!(request.priority, Priority::Low);
        assert_eq!(request.deadline, Some(Duration::from_secs(30)));
        assert_eq!(request.workspace, Some(PathBuf::from("/tmp/agents/docs")));
    }
}
