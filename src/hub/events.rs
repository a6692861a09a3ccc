// Typed broadcast events, keyed by (project, EventKind)

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{ReviewOutcome, WorkItem};

/// The closed set of things the hub can broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ItemStatusUpdated,
    ItemReleased,
    IdentityClaimed,
    IdentityReleased,
    Transition,
    ReviewRequested,
    ChangesRequested,
    Approved,
    ReviewCompleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ItemStatusUpdated => "item-status-updated",
            EventKind::ItemReleased => "item-released",
            EventKind::IdentityClaimed => "identity-claimed",
            EventKind::IdentityReleased => "identity-released",
            EventKind::Transition => "transition",
            EventKind::ReviewRequested => "review-requested",
            EventKind::ChangesRequested => "changes-requested",
            EventKind::Approved => "approved",
            EventKind::ReviewCompleted => "review-completed",
        };
        write!(f, "{name}")
    }
}

/// Why a work item lost its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseReason {
    ClaimExpired,
    OwnerDisconnected,
}

/// Why an identity was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityReleaseReason {
    Replaced,
    Disconnected,
}

/// Payload shared by the transition broadcast and the targeted notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionNotice {
    pub project: String,
    pub item_id: String,
    pub old_status: String,
    pub new_status: String,
    pub actor: String,
    pub role: String,
    pub branch_ref: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HubEvent {
    ItemStatusUpdated {
        project: String,
        item: WorkItem,
    },
    ItemReleased {
        project: String,
        item_id: String,
        claimant: String,
        reason: ReleaseReason,
    },
    IdentityClaimed {
        project: String,
        name: String,
        role: String,
    },
    IdentityReleased {
        project: String,
        name: String,
        reason: IdentityReleaseReason,
    },
    Transition(TransitionNotice),
    /// Targeted at reviewer-like roles
    ReviewRequested(TransitionNotice),
    /// Targeted at developer roles
    ChangesRequested(TransitionNotice),
    /// Targeted at every role
    Approved(TransitionNotice),
    ReviewCompleted {
        project: String,
        item_id: String,
        reviewer: String,
        outcome: ReviewOutcome,
        status: String,
        findings: Vec<String>,
        branch_ref: Option<String>,
    },
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::ItemStatusUpdated { .. } => EventKind::ItemStatusUpdated,
            HubEvent::ItemReleased { .. } => EventKind::ItemReleased,
            HubEvent::IdentityClaimed { .. } => EventKind::IdentityClaimed,
            HubEvent::IdentityReleased { .. } => EventKind::IdentityReleased,
            HubEvent::Transition(_) => EventKind::Transition,
            HubEvent::ReviewRequested(_) => EventKind::ReviewRequested,
            HubEvent::ChangesRequested(_) => EventKind::ChangesRequested,
            HubEvent::Approved(_) => EventKind::Approved,
            HubEvent::ReviewCompleted { .. } => EventKind::ReviewCompleted,
        }
    }

    pub fn project(&self) -> &str {
        match self {
            HubEvent::ItemStatusUpdated { project, .. }
            | HubEvent::ItemReleased { project, .. }
            | HubEvent::IdentityClaimed { project, .. }
            | HubEvent::IdentityReleased { project, .. }
            | HubEvent::ReviewCompleted { project, .. } => project,
            HubEvent::Transition(notice)
            | HubEvent::ReviewRequested(notice)
            | HubEvent::ChangesRequested(notice)
            | HubEvent::Approved(notice) => &notice.project,
        }
    }

    /// Work item this event is about, if any
    pub fn item_id(&self) -> Option<&str> {
        match self {
            HubEvent::ItemStatusUpdated { item, .. } => Some(&item.id),
            HubEvent::ItemReleased { item_id, .. } | HubEvent::ReviewCompleted { item_id, .. } => {
                Some(item_id)
            }
            HubEvent::Transition(notice)
            | HubEvent::ReviewRequested(notice)
            | HubEvent::ChangesRequested(notice)
            | HubEvent::Approved(notice) => Some(&notice.item_id),
            HubEvent::IdentityClaimed { .. } | HubEvent::IdentityReleased { .. } => None,
        }
    }
}
