// Core records held by the coordination hub

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the hub assigns to every attached connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A unit of trackable work with an optional owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub epic_id: String,
    pub project: String,
    /// Free-form status label
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub last_update: DateTime<Utc>,
    pub notes: Option<String>,
    /// Connection that placed the current claim; only the disconnect policy reads it
    #[serde(skip)]
    pub claim_connection: Option<ConnectionId>,
    /// Bumped on every fresh claim so stale auto-release timers can tell they lost
    #[serde(skip)]
    pub claim_generation: u64,
}

impl WorkItem {
    pub fn new(
        id: impl Into<String>,
        epic_id: impl Into<String>,
        project: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            epic_id: epic_id.into(),
            project: project.into(),
            status: status.into(),
            claimed_by: None,
            claimed_at: None,
            progress: 0,
            last_update: Utc::now(),
            notes: None,
            claim_connection: None,
            claim_generation: 0,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    pub fn is_held_by(&self, claimant: &str) -> bool {
        self.claimed_by.as_deref() == Some(claimant)
    }
}

/// Registration payload for seeding the backlog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub id: String,
    pub epic_id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl NewWorkItem {
    pub fn new(id: impl Into<String>, epic_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            epic_id: epic_id.into(),
            project: None,
            status: None,
        }
    }

    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// A symbolic agent name claimed inside a project scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub project: String,
    pub name: String,
    pub role: String,
    pub owner_connection: ConnectionId,
    pub claimed_at: DateTime<Utc>,
}

impl AgentIdentity {
    pub fn full_name(&self) -> String {
        full_identity_name(&self.project, &self.name)
    }
}

pub fn full_identity_name(project: &str, name: &str) -> String {
    format!("{project}:{name}")
}

/// Exclusive review lock on a work item, independent of item ownership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewClaim {
    pub item_id: String,
    pub reviewer: String,
    pub review_type: String,
    pub claimed_at: DateTime<Utc>,
}

/// A connection's interest in workflow events for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSubscription {
    pub project: String,
    pub connection: ConnectionId,
    pub role: String,
    pub agent_name: String,
    /// Event kinds to deliver; `None` means every kind
    pub kinds: Option<Vec<super::events::EventKind>>,
}

impl WorkflowSubscription {
    pub fn accepts(&self, kind: super::events::EventKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

/// Last published workflow status of an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub item_id: String,
    pub project: String,
    pub status: String,
    pub previous_status: String,
    pub actor: String,
    pub role: String,
    pub branch_ref: Option<String>,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Verdict passed to `complete_review`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewOutcome {
    Approved,
    NeedsChanges,
    Rejected,
    Other(String),
}

impl ReviewOutcome {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "approved" | "approve" => ReviewOutcome::Approved,
            "needs-changes" | "changes-requested" | "request-changes" => {
                ReviewOutcome::NeedsChanges
            }
            "rejected" | "reject" => ReviewOutcome::Rejected,
            _ => ReviewOutcome::Other(raw.to_string()),
        }
    }
}

impl fmt::Display for ReviewOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewOutcome::Approved => write!(f, "approved"),
            ReviewOutcome::NeedsChanges => write!(f, "needs-changes"),
            ReviewOutcome::Rejected => write!(f, "rejected"),
            ReviewOutcome::Other(label) => write!(f, "{label}"),
        }
    }
}

/// Completion summary for one epic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpicProgress {
    pub epic_id: String,
    pub total: usize,
    pub completed: usize,
    pub in_progress: usize,
    pub available: usize,
    pub pct: u8,
}

impl EpicProgress {
    pub fn percentage(completed: usize, total: usize) -> u8 {
        if total == 0 {
            return 100;
        }
        ((completed as f64 / total as f64) * 100.0).round() as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_outcome_parsing() {
        assert_eq!(ReviewOutcome::parse("approved"), ReviewOutcome::Approved);
        assert_eq!(ReviewOutcome::parse("Needs_Changes"), ReviewOutcome::NeedsChanges);
        assert_eq!(ReviewOutcome::parse("rejected"), ReviewOutcome::Rejected);
        assert_eq!(
            ReviewOutcome::parse("deferred"),
            ReviewOutcome::Other("deferred".to_string())
        );
    }

    #[test]
    fn test_epic_percentage_rounding() {
        assert_eq!(EpicProgress::percentage(0, 0), 100);
        assert_eq!(EpicProgress::percentage(1, 3), 33);
        assert_eq!(EpicProgress::percentage(2, 3), 67);
        assert_eq!(EpicProgress::percentage(3, 3), 100);
    }
}
