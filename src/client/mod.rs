//! Coordination Client
//!
//! Per-connection façade over a [`HubTransport`]. Every agent and the
//! orchestrator talk to the hub through one of these: typed wrappers around
//! the request/response operations, the identity the connection has claimed,
//! and the stream of broadcasts addressed to it.

pub mod transport;

use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

pub use transport::{HubTransport, LocalTransport, TcpTransport};

use crate::hub::{
    AgentIdentity, EpicProgress, EventKind, HubError, HubEvent, HubHandle, HubReply, HubRequest,
    NewWorkItem, ReviewClaim, WorkItem, WorkflowStatus,
};

/// Optional parts of a `claim_work` call
#[derive(Debug, Clone, Default)]
pub struct ClaimOptions {
    /// Registers the item on the fly when the hub does not know it
    pub epic_id: Option<String>,
    pub project: Option<String>,
    /// Auto-release after this long unless the claim was superseded.
    /// The hub counts whole seconds, so a fractional timeout is rounded up.
    pub timeout: Option<Duration>,
}

impl ClaimOptions {
    pub fn in_epic(epic_id: impl Into<String>) -> Self {
        Self {
            epic_id: Some(epic_id.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn in_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

fn whole_seconds_rounded_up(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// A status transition to publish
#[derive(Debug, Clone)]
pub struct Transition {
    pub item_id: String,
    pub old_status: String,
    pub new_status: String,
    pub actor: String,
    pub role: String,
    pub branch_ref: Option<String>,
    pub notes: Option<String>,
}

impl Transition {
    pub fn new(
        item_id: impl Into<String>,
        old_status: impl Into<String>,
        new_status: impl Into<String>,
        actor: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            old_status: old_status.into(),
            new_status: new_status.into(),
            actor: actor.into(),
            role: role.into(),
            branch_ref: None,
            notes: None,
        }
    }

    pub fn with_branch(mut self, branch_ref: impl Into<String>) -> Self {
        self.branch_ref = Some(branch_ref.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

pub struct CoordinationClient {
    transport: Box<dyn HubTransport>,
    events: Mutex<mpsc::UnboundedReceiver<HubEvent>>,
    identity: RwLock<Option<AgentIdentity>>,
}

impl CoordinationClient {
    pub fn new(transport: Box<dyn HubTransport>, events: mpsc::UnboundedReceiver<HubEvent>) -> Self {
        Self {
            transport,
            events: Mutex::new(events),
            identity: RwLock::new(None),
        }
    }

    /// Connect to a hub running in this process
    pub async fn connect_local(hub: HubHandle) -> Result<Self, HubError> {
        let (transport, events) = LocalTransport::connect(hub).await?;
        debug!(connection = %transport.connection(), "Local hub client connected");
        Ok(Self::new(Box::new(transport), events))
    }

    /// Connect to a hub server over TCP
    pub async fn connect_tcp(address: &str) -> anyhow::Result<Self> {
        let (transport, events) = TcpTransport::connect(address).await?;
        info!(address = %address, "Connected to hub server");
        Ok(Self::new(Box::new(transport), events))
    }

    /// The identity this connection holds, if any
    pub fn identity(&self) -> Option<AgentIdentity> {
        self.identity.read().ok().and_then(|identity| identity.clone())
    }

    pub async fn claim_identity(
        &self,
        name: &str,
        role: &str,
        project: &str,
    ) -> Result<String, HubError> {
        let reply = self
            .transport
            .call(HubRequest::ClaimIdentity {
                name: name.to_string(),
                role: role.to_string(),
                project: project.to_string(),
            })
            .await?;
        let HubReply::Identity {
            full_name,
            identity,
        } = reply
        else {
            return Err(unexpected("claim_identity"));
        };
        if let Ok(mut held) = self.identity.write() {
            *held = Some(identity);
        }
        Ok(full_name)
    }

    pub async fn list_identities(
        &self,
        project: Option<&str>,
    ) -> Result<Vec<AgentIdentity>, HubError> {
        match self
            .transport
            .call(HubRequest::ListIdentities {
                project: project.map(str::to_string),
            })
            .await?
        {
            HubReply::Identities { identities } => Ok(identities),
            _ => Err(unexpected("list_identities")),
        }
    }

    pub async fn claim_work(
        &self,
        item_id: &str,
        claimant: &str,
        options: ClaimOptions,
    ) -> Result<WorkItem, HubError> {
        let request = HubRequest::ClaimWork {
            item_id: item_id.to_string(),
            claimant: claimant.to_string(),
            epic_id: options.epic_id,
            project: options.project,
            timeout_secs: options.timeout.map(whole_seconds_rounded_up),
        };
        expect_item("claim_work", self.transport.call(request).await?)
    }

    pub async fn release_work(&self, item_id: &str, claimant: &str) -> Result<WorkItem, HubError> {
        let request = HubRequest::ReleaseWork {
            item_id: item_id.to_string(),
            claimant: claimant.to_string(),
        };
        expect_item("release_work", self.transport.call(request).await?)
    }

    pub async fn update_status(
        &self,
        item_id: &str,
        claimant: &str,
        status: &str,
        progress: u8,
        notes: Option<String>,
    ) -> Result<WorkItem, HubError> {
        let request = HubRequest::UpdateStatus {
            item_id: item_id.to_string(),
            claimant: claimant.to_string(),
            status: status.to_string(),
            progress,
            notes,
        };
        expect_item("update_status", self.transport.call(request).await?)
    }

    pub async fn list_available(&self, epic_id: Option<&str>) -> Result<Vec<WorkItem>, HubError> {
        match self
            .transport
            .call(HubRequest::ListAvailable {
                epic_id: epic_id.map(str::to_string),
            })
            .await?
        {
            HubReply::Items { items } => Ok(items),
            _ => Err(unexpected("list_available")),
        }
    }

    pub async fn epic_progress(&self, epic_id: &str) -> Result<EpicProgress, HubError> {
        match self
            .transport
            .call(HubRequest::EpicProgress {
                epic_id: epic_id.to_string(),
            })
            .await?
        {
            HubReply::Progress { progress } => Ok(progress),
            _ => Err(unexpected("epic_progress")),
        }
    }

    pub async fn subscribe_workflow(
        &self,
        project: &str,
        role: &str,
        agent_name: &str,
        kinds: Option<Vec<EventKind>>,
    ) -> Result<(), HubError> {
        match self
            .transport
            .call(HubRequest::SubscribeWorkflow {
                project: project.to_string(),
                role: role.to_string(),
                agent_name: agent_name.to_string(),
                kinds,
            })
            .await?
        {
            HubReply::Subscribed { .. } => Ok(()),
            _ => Err(unexpected("subscribe_workflow")),
        }
    }

    /// Returns how many connections received the transition broadcast
    pub async fn publish_transition(&self, transition: Transition) -> Result<usize, HubError> {
        match self
            .transport
            .call(HubRequest::PublishTransition {
                item_id: transition.item_id,
                old_status: transition.old_status,
                new_status: transition.new_status,
                actor: transition.actor,
                role: transition.role,
                branch_ref: transition.branch_ref,
                notes: transition.notes,
            })
            .await?
        {
            HubReply::Published { notified } => Ok(notified),
            _ => Err(unexpected("publish_transition")),
        }
    }

    pub async fn claim_review(
        &self,
        item_id: &str,
        reviewer: &str,
        review_type: &str,
    ) -> Result<ReviewClaim, HubError> {
        match self
            .transport
            .call(HubRequest::ClaimReview {
                item_id: item_id.to_string(),
                reviewer: reviewer.to_string(),
                review_type: review_type.to_string(),
            })
            .await?
        {
            HubReply::ReviewClaimed { claim } => Ok(claim),
            _ => Err(unexpected("claim_review")),
        }
    }

    /// Returns the status label the outcome mapped to
    pub async fn complete_review(
        &self,
        item_id: &str,
        reviewer: &str,
        outcome: &str,
        findings: Vec<String>,
        branch_ref: Option<String>,
    ) -> Result<String, HubError> {
        match self
            .transport
            .call(HubRequest::CompleteReview {
                item_id: item_id.to_string(),
                reviewer: reviewer.to_string(),
                outcome: outcome.to_string(),
                findings,
                branch_ref,
            })
            .await?
        {
            HubReply::ReviewCompleted { status } => Ok(status),
            _ => Err(unexpected("complete_review")),
        }
    }

    pub async fn register_work(&self, item: NewWorkItem) -> Result<WorkItem, HubError> {
        expect_item(
            "register_work",
            self.transport.call(HubRequest::RegisterWork { item }).await?,
        )
    }

    pub async fn get_work(&self, item_id: &str) -> Result<WorkItem, HubError> {
        let request = HubRequest::GetWork {
            item_id: item_id.to_string(),
        };
        expect_item("get_work", self.transport.call(request).await?)
    }

    pub async fn workflow_status(&self, item_id: &str) -> Result<Option<WorkflowStatus>, HubError> {
        match self
            .transport
            .call(HubRequest::WorkflowStatus {
                item_id: item_id.to_string(),
            })
            .await?
        {
            HubReply::Workflow { status } => Ok(status),
            _ => Err(unexpected("workflow_status")),
        }
    }

    /// Claim the first available item (lowest id) that nobody else grabs first
    pub async fn claim_next_available(
        &self,
        claimant: &str,
        epic_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Option<WorkItem>, HubError> {
        for candidate in self.list_available(epic_id).await? {
            let options = ClaimOptions {
                timeout,
                ..ClaimOptions::default()
            };
            match self.claim_work(&candidate.id, claimant, options).await {
                Ok(item) => return Ok(Some(item)),
                Err(HubError::ClaimConflict { .. }) | Err(HubError::NotFound { .. }) => {
                    debug!(item_id = %candidate.id, "Lost race for work item, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Wait for the next broadcast; `None` once the connection is gone
    pub async fn next_event(&self) -> Option<HubEvent> {
        self.events.lock().await.recv().await
    }

    pub async fn try_next_event(&self) -> Option<HubEvent> {
        self.events.lock().await.try_recv().ok()
    }

    /// Close the connection; the hub frees this connection's identity
    pub async fn disconnect(&self) {
        self.transport.close().await;
        if let Ok(mut held) = self.identity.write() {
            *held = None;
        }
    }
}

fn unexpected(operation: &str) -> HubError {
    HubError::UnexpectedReply {
        operation: operation.to_string(),
    }
}

fn expect_item(operation: &str, reply: HubReply) -> Result<WorkItem, HubError> {
    match reply {
        HubReply::Item { item } => Ok(item),
        _ => Err(unexpected(operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::transport::MockHubTransport;
    use super::*;

    fn client(transport: MockHubTransport) -> CoordinationClient {
        let (_tx, rx) = mpsc::unbounded_channel();
        CoordinationClient::new(Box::new(transport), rx)
    }

    #[test]
    fn test_fractional_timeouts_round_up_to_whole_seconds() {
        assert_eq!(whole_seconds_rounded_up(Duration::from_millis(200)), 1);
        assert_eq!(whole_seconds_rounded_up(Duration::from_millis(2500)), 3);
        assert_eq!(whole_seconds_rounded_up(Duration::from_secs(5)), 5);
        assert_eq!(whole_seconds_rounded_up(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_claim_timeout_goes_out_rounded_up() {
        let mut transport = MockHubTransport::new();
        transport
            .expect_call()
            .withf(|request| {
                matches!(request, HubRequest::ClaimWork { timeout_secs: Some(2), .. })
            })
            .returning(|_| Err(HubError::Disconnected));

        let err = client(transport)
            .claim_work(
                "1.1",
                "dev-A",
                ClaimOptions::default().with_timeout(Duration::from_millis(1500)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, HubError::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_reply_shape_is_reported() {
        let mut transport = MockHubTransport::new();
        transport
            .expect_call()
            .returning(|_| Ok(HubReply::Published { notified: 0 }));

        let err = client(transport).get_work("1.1").await.unwrap_err();
        assert_eq!(
            err,
            HubError::UnexpectedReply {
                operation: "get_work".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_claim_next_available_skips_lost_races() {
        let mut transport = MockHubTransport::new();
        transport.expect_call().returning(|request| match request {
            HubRequest::ListAvailable { .. } => Ok(HubReply::Items {
                items: vec![
                    WorkItem::new("1.1", "1", "default", "available"),
                    WorkItem::new("1.2", "1", "default", "available"),
                ],
            }),
            HubRequest::ClaimWork { item_id, .. } if item_id == "1.1" => {
                Err(HubError::ClaimConflict {
                    item_id,
                    held_by: "dev-B".to_string(),
                })
            }
            HubRequest::ClaimWork { item_id, claimant, .. } => {
                let mut item = WorkItem::new(item_id, "1", "default", "in-progress");
                item.claimed_by = Some(claimant);
                Ok(HubReply::Item { item })
            }
            other => panic!("unexpected request {other:?}"),
        });

        let item = client(transport)
            .claim_next_available("dev-A", Some("1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.id, "1.2");
        assert!(item.is_held_by("dev-A"));
    }

    #[tokio::test]
    async fn test_claim_identity_remembers_the_identity() {
        let mut transport = MockHubTransport::new();
        transport.expect_call().returning(|request| match request {
            HubRequest::ClaimIdentity { name, role, project } => Ok(HubReply::Identity {
                full_name: format!("{project}:{name}"),
                identity: AgentIdentity {
                    project,
                    name,
                    role,
                    owner_connection: crate::hub::ConnectionId(1),
                    claimed_at: chrono::Utc::now(),
                },
            }),
            other => panic!("unexpected request {other:?}"),
        });
        transport.expect_close().times(1).returning(|| ());

        let client = client(transport);
        assert!(client.identity().is_none());
        let full_name = client.claim_identity("rev-1", "reviewer", "alpha").await.unwrap();
        assert_eq!(full_name, "alpha:rev-1");
        assert_eq!(client.identity().map(|i| i.role), Some("reviewer".to_string()));

        client.disconnect().await;
        assert!(client.identity().is_none());
    }
}
