//! Registry Store
//!
//! Keyed collections behind the hub: work items, agent identities, review
//! claims, workflow subscriptions and workflow status snapshots. The store has
//! no behaviour beyond get/put/remove; every rule lives in the hub. Backends
//! implement [`RegistryStore`], so a durable one can replace
//! [`InMemoryRegistry`] without touching operation logic.

use std::collections::{BTreeMap, HashMap};

use super::types::{
    AgentIdentity, ConnectionId, ReviewClaim, WorkItem, WorkflowStatus, WorkflowSubscription,
};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

#[cfg_attr(any(test, feature = "testing"), automock)]
pub trait RegistryStore {
    fn item(&self, item_id: &str) -> Option<WorkItem>;
    fn put_item(&mut self, item: WorkItem);
    /// All items ordered by id
    fn items(&self) -> Vec<WorkItem>;

    fn identity(&self, project: &str, name: &str) -> Option<AgentIdentity>;
    fn identity_for_connection(&self, connection: ConnectionId) -> Option<AgentIdentity>;
    fn put_identity(&mut self, identity: AgentIdentity);
    fn remove_identity(&mut self, project: &str, name: &str) -> Option<AgentIdentity>;
    fn identities(&self) -> Vec<AgentIdentity>;

    fn review(&self, item_id: &str) -> Option<ReviewClaim>;
    fn put_review(&mut self, claim: ReviewClaim);
    fn remove_review(&mut self, item_id: &str) -> Option<ReviewClaim>;

    fn subscription(&self, project: &str, connection: ConnectionId)
        -> Option<WorkflowSubscription>;
    fn put_subscription(&mut self, subscription: WorkflowSubscription);
    fn remove_subscriptions(&mut self, connection: ConnectionId) -> Vec<WorkflowSubscription>;
    fn subscriptions(&self, project: &str) -> Vec<WorkflowSubscription>;

    fn workflow_status(&self, item_id: &str) -> Option<WorkflowStatus>;
    fn put_workflow_status(&mut self, status: WorkflowStatus);
}

/// Plain in-memory backend. State is lost when the hub stops.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    items: BTreeMap<String, WorkItem>,
    identities: HashMap<(String, String), AgentIdentity>,
    reviews: HashMap<String, ReviewClaim>,
    subscriptions: HashMap<(String, ConnectionId), WorkflowSubscription>,
    workflow: HashMap<String, WorkflowStatus>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for InMemoryRegistry {
    fn item(&self, item_id: &str) -> Option<WorkItem> {
        self.items.get(item_id).cloned()
    }

    fn put_item(&mut self, item: WorkItem) {
        self.items.insert(item.id.clone(), item);
    }

    fn items(&self) -> Vec<WorkItem> {
        self.items.values().cloned().collect()
    }

    fn identity(&self, project: &str, name: &str) -> Option<AgentIdentity> {
        self.identities
            .get(&(project.to_string(), name.to_string()))
            .cloned()
    }

    fn identity_for_connection(&self, connection: ConnectionId) -> Option<AgentIdentity> {
        self.identities
            .values()
            .find(|identity| identity.owner_connection == connection)
            .cloned()
    }

    fn put_identity(&mut self, identity: AgentIdentity) {
        self.identities
            .insert((identity.project.clone(), identity.name.clone()), identity);
    }

    fn remove_identity(&mut self, project: &str, name: &str) -> Option<AgentIdentity> {
        self.identities
            .remove(&(project.to_string(), name.to_string()))
    }

    fn identities(&self) -> Vec<AgentIdentity> {
        let mut identities: Vec<_> = self.identities.values().cloned().collect();
        identities.sort_by(|a, b| (&a.project, &a.name).cmp(&(&b.project, &b.name)));
        identities
    }

    fn review(&self, item_id: &str) -> Option<ReviewClaim> {
        self.reviews.get(item_id).cloned()
    }

    fn put_review(&mut self, claim: ReviewClaim) {
        self.reviews.insert(claim.item_id.clone(), claim);
    }

    fn remove_review(&mut self, item_id: &str) -> Option<ReviewClaim> {
        self.reviews.remove(item_id)
    }

    fn subscription(
        &self,
        project: &str,
        connection: ConnectionId,
    ) -> Option<WorkflowSubscription> {
        self.subscriptions
            .get(&(project.to_string(), connection))
            .cloned()
    }

    fn put_subscription(&mut self, subscription: WorkflowSubscription) {
        self.subscriptions.insert(
            (subscription.project.clone(), subscription.connection),
            subscription,
        );
    }

    fn remove_subscriptions(&mut self, connection: ConnectionId) -> Vec<WorkflowSubscription> {
        let keys: Vec<_> = self
            .subscriptions
            .keys()
            .filter(|(_, conn)| *conn == connection)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.subscriptions.remove(&key))
            .collect()
    }

    fn subscriptions(&self, project: &str) -> Vec<WorkflowSubscription> {
        let mut subscriptions: Vec<_> = self
            .subscriptions
            .values()
            .filter(|sub| sub.project == project)
            .cloned()
            .collect();
        subscriptions.sort_by_key(|sub| sub.connection);
        subscriptions
    }

    fn workflow_status(&self, item_id: &str) -> Option<WorkflowStatus> {
        self.workflow.get(item_id).cloned()
    }

    fn put_workflow_status(&mut self, status: WorkflowStatus) {
        self.workflow.insert(status.item_id.clone(), status);
    }
}
