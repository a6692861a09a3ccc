//! Request/reply vocabulary of the hub and its newline-delimited JSON framing.
//!
//! The same [`HubRequest`] and [`HubReply`] values are used in-process and on
//! the wire; the TCP transport only adds [`ClientFrame`] and [`ServerFrame`]
//! around them.

use serde::{Deserialize, Serialize};

use super::errors::HubError;
use super::events::{EventKind, HubEvent};
use super::types::{
    AgentIdentity, EpicProgress, NewWorkItem, ReviewClaim, WorkItem, WorkflowStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HubRequest {
    ClaimWork {
        item_id: String,
        claimant: String,
        #[serde(default)]
        epic_id: Option<String>,
        #[serde(default)]
        project: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    ReleaseWork {
        item_id: String,
        claimant: String,
    },
    UpdateStatus {
        item_id: String,
        claimant: String,
        status: String,
        progress: u8,
        #[serde(default)]
        notes: Option<String>,
    },
    ListAvailable {
        #[serde(default)]
        epic_id: Option<String>,
    },
    EpicProgress {
        epic_id: String,
    },
    ClaimIdentity {
        name: String,
        role: String,
        project: String,
    },
    ListIdentities {
        #[serde(default)]
        project: Option<String>,
    },
    SubscribeWorkflow {
        project: String,
        role: String,
        agent_name: String,
        #[serde(default)]
        kinds: Option<Vec<EventKind>>,
    },
    PublishTransition {
        item_id: String,
        old_status: String,
        new_status: String,
        actor: String,
        role: String,
        #[serde(default)]
        branch_ref: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },
    ClaimReview {
        item_id: String,
        reviewer: String,
        review_type: String,
    },
    CompleteReview {
        item_id: String,
        reviewer: String,
        outcome: String,
        #[serde(default)]
        findings: Vec<String>,
        #[serde(default)]
        branch_ref: Option<String>,
    },
    RegisterWork {
        item: NewWorkItem,
    },
    GetWork {
        item_id: String,
    },
    WorkflowStatus {
        item_id: String,
    },
}

impl HubRequest {
    /// Operation name, used as a log field and in `UnexpectedReply`
    pub fn operation(&self) -> &'static str {
        match self {
            HubRequest::ClaimWork { .. } => "claim_work",
            HubRequest::ReleaseWork { .. } => "release_work",
            HubRequest::UpdateStatus { .. } => "update_status",
            HubRequest::ListAvailable { .. } => "list_available",
            HubRequest::EpicProgress { .. } => "epic_progress",
            HubRequest::ClaimIdentity { .. } => "claim_identity",
            HubRequest::ListIdentities { .. } => "list_identities",
            HubRequest::SubscribeWorkflow { .. } => "subscribe_workflow",
            HubRequest::PublishTransition { .. } => "publish_transition",
            HubRequest::ClaimReview { .. } => "claim_review",
            HubRequest::CompleteReview { .. } => "complete_review",
            HubRequest::RegisterWork { .. } => "register_work",
            HubRequest::GetWork { .. } => "get_work",
            HubRequest::WorkflowStatus { .. } => "workflow_status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum HubReply {
    Item { item: WorkItem },
    Items { items: Vec<WorkItem> },
    Progress { progress: EpicProgress },
    Identity {
        full_name: String,
        identity: AgentIdentity,
    },
    Identities { identities: Vec<AgentIdentity> },
    Subscribed { project: String },
    /// Number of connections that received the transition broadcast
    Published { notified: usize },
    ReviewClaimed { claim: ReviewClaim },
    ReviewCompleted { status: String },
    Workflow { status: Option<WorkflowStatus> },
}

pub type HubResult = Result<HubReply, HubError>;

/// One line sent by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    pub request: HubRequest,
}

/// One line sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Response {
        /// Absent when the offending line had no recoverable id
        id: Option<u64>,
        result: HubResult,
    },
    Event {
        event: HubEvent,
    },
}

/// Decode a client line, mapping anything unreadable to `MalformedRequest`.
///
/// The error side carries the request id whenever the line was valid JSON
/// with a numeric `id`, so the reply can still be correlated.
pub fn decode_client_line(line: &str) -> Result<ClientFrame, (Option<u64>, HubError)> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| (None, HubError::malformed(e)))?;
    let id = value.get("id").and_then(serde_json::Value::as_u64);
    serde_json::from_value(value).map_err(|e| (id, HubError::malformed(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_shape() {
        let line = r#"{"id":7,"request":{"op":"claim_work","item_id":"10.1","claimant":"dev-A","timeout_secs":5}}"#;
        let frame = decode_client_line(line).unwrap();
        assert_eq!(frame.id, 7);
        assert_eq!(
            frame.request,
            HubRequest::ClaimWork {
                item_id: "10.1".to_string(),
                claimant: "dev-A".to_string(),
                epic_id: None,
                project: None,
                timeout_secs: Some(5),
            }
        );
    }

    #[test]
    fn test_unknown_op_keeps_the_id() {
        let (id, error) = decode_client_line(r#"{"id":3,"request":{"op":"launch"}}"#).unwrap_err();
        assert_eq!(id, Some(3));
        assert_eq!(error.kind(), "malformed_request");

        let (id, _) = decode_client_line("not json").unwrap_err();
        assert_eq!(id, None);
    }

    #[test]
    fn test_response_frame_uses_ok_err_envelope() {
        let frame = ServerFrame::Response {
            id: Some(1),
            result: Err(HubError::not_found("work item 9.9")),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["result"]["Err"]["error"], "not_found");

        let frame = ServerFrame::Response {
            id: Some(2),
            result: Ok(HubReply::Published { notified: 2 }),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["result"]["Ok"]["notified"], 2);
    }
}
