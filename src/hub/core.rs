//! Coordination Hub
//!
//! [`Hub`] holds the registry and applies every operation synchronously, one
//! at a time. It knows nothing about sockets or tasks: the actor in
//! `hub::actor` owns a `Hub` and feeds it requests, connection changes and
//! timer wakeups in arrival order.
//!
//! Broadcasts are scoped to a project. A connection is a member of project P
//! while it holds an identity in P or a workflow subscription in P, and it
//! never receives events it caused itself.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::errors::HubError;
use super::events::{HubEvent, IdentityReleaseReason, ReleaseReason, TransitionNotice};
use super::protocol::{HubReply, HubRequest, HubResult};
use super::registry::{InMemoryRegistry, RegistryStore};
use super::types::{
    full_identity_name, AgentIdentity, ConnectionId, EpicProgress, NewWorkItem, ReviewClaim,
    ReviewOutcome, WorkItem, WorkflowStatus, WorkflowSubscription,
};
use super::vocabulary::{RoleClass, StatusSignal, StatusVocabulary, TransitionPolicy};
use crate::config::{DisconnectPolicy, HubConfig};
use crate::observability::hub_metrics;
use crate::scheduler::{DeadlineScheduler, TimerId};

/// Runtime settings derived from [`HubConfig`]
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub default_project: String,
    pub disconnect_policy: DisconnectPolicy,
    pub vocabulary: StatusVocabulary,
    pub transitions: TransitionPolicy,
}

impl HubSettings {
    pub fn from_config(config: &HubConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            default_project: config.default_project.clone(),
            disconnect_policy: config.disconnect_policy,
            vocabulary: StatusVocabulary::from_config(&config.vocabulary)?,
            transitions: TransitionPolicy::from_config(&config.transitions),
        })
    }
}

/// Auto-release timer payload. The release only happens if the item still
/// matches all three fields when the timer fires.
#[derive(Debug, Clone)]
struct ClaimTimer {
    item_id: String,
    claimant: String,
    generation: u64,
    status: String,
}

pub struct Hub {
    store: Box<dyn RegistryStore + Send>,
    settings: HubSettings,
    timers: DeadlineScheduler<ClaimTimer>,
    claim_timers: HashMap<String, TimerId>,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<HubEvent>>,
    next_connection: u64,
    next_generation: u64,
}

impl Hub {
    pub fn new(store: Box<dyn RegistryStore + Send>, settings: HubSettings) -> Self {
        Self {
            store,
            settings,
            timers: DeadlineScheduler::new(),
            claim_timers: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 1,
            next_generation: 0,
        }
    }

    pub fn in_memory(settings: HubSettings) -> Self {
        Self::new(Box::new(InMemoryRegistry::new()), settings)
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Register a new connection and the channel its broadcasts go to
    pub fn attach(&mut self, events: mpsc::UnboundedSender<HubEvent>) -> ConnectionId {
        let connection = ConnectionId(self.next_connection);
        self.next_connection += 1;
        self.connections.insert(connection, events);
        hub_metrics().record_connection();
        debug!(connection = %connection, "Connection attached");
        connection
    }

    /// Drop a connection: its identity and subscriptions go away, and its
    /// claims follow the configured disconnect policy
    pub fn detach(&mut self, connection: ConnectionId) {
        if self.connections.remove(&connection).is_none() {
            return;
        }

        if self.settings.disconnect_policy == DisconnectPolicy::ReleaseOnDisconnect {
            let held: Vec<WorkItem> = self
                .store
                .items()
                .into_iter()
                .filter(|item| item.is_claimed() && item.claim_connection == Some(connection))
                .collect();
            for item in held {
                let claimant = item.claimed_by.clone().unwrap_or_default();
                info!(
                    item_id = %item.id,
                    claimant = %claimant,
                    connection = %connection,
                    "Releasing claim of disconnected owner"
                );
                let project = item.project.clone();
                let item_id = item.id.clone();
                self.clear_claim(item);
                self.broadcast(
                    Some(connection),
                    HubEvent::ItemReleased {
                        project,
                        item_id,
                        claimant,
                        reason: ReleaseReason::OwnerDisconnected,
                    },
                );
            }
        }

        if let Some(identity) = self.store.identity_for_connection(connection) {
            self.store.remove_identity(&identity.project, &identity.name);
            info!(
                identity = %identity.full_name(),
                connection = %connection,
                "Identity released on disconnect"
            );
            self.broadcast(
                Some(connection),
                HubEvent::IdentityReleased {
                    project: identity.project,
                    name: identity.name,
                    reason: IdentityReleaseReason::Disconnected,
                },
            );
        }

        let removed = self.store.remove_subscriptions(connection);
        debug!(
            connection = %connection,
            subscriptions = removed.len(),
            "Connection detached"
        );
    }

    /// Earliest pending auto-release
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Apply every auto-release whose deadline has passed
    pub fn fire_expired(&mut self, now: Instant) {
        for timer in self.timers.pop_expired(now) {
            if let Some(id) = self.claim_timers.get(&timer.item_id).copied() {
                if !self.timers.is_pending(id) {
                    self.claim_timers.remove(&timer.item_id);
                }
            }

            let Some(item) = self.store.item(&timer.item_id) else {
                continue;
            };
            let still_same_claim = item.is_held_by(&timer.claimant)
                && item.claim_generation == timer.generation
                && item.status == timer.status;
            if !still_same_claim {
                debug!(
                    item_id = %timer.item_id,
                    claimant = %timer.claimant,
                    "Auto-release skipped, claim was superseded"
                );
                continue;
            }

            info!(
                item_id = %item.id,
                claimant = %timer.claimant,
                "Claim expired, releasing work item"
            );
            hub_metrics().record_auto_release();
            let project = item.project.clone();
            self.clear_claim(item);
            self.broadcast(
                None,
                HubEvent::ItemReleased {
                    project,
                    item_id: timer.item_id,
                    claimant: timer.claimant,
                    reason: ReleaseReason::ClaimExpired,
                },
            );
        }
    }

    /// Execute one request on behalf of `connection`
    pub fn handle(&mut self, connection: ConnectionId, request: HubRequest) -> HubResult {
        hub_metrics().record_request();
        let operation = request.operation();
        let result = self.dispatch(connection, request);
        if let Err(error) = &result {
            hub_metrics().record_error();
            debug!(
                connection = %connection,
                operation = operation,
                error.kind = error.kind(),
                "Hub request rejected: {}",
                error
            );
        }
        result
    }

    fn dispatch(&mut self, connection: ConnectionId, request: HubRequest) -> HubResult {
        match request {
            HubRequest::ClaimWork {
                item_id,
                claimant,
                epic_id,
                project,
                timeout_secs,
            } => self.claim_work(connection, item_id, claimant, epic_id, project, timeout_secs),
            HubRequest::ReleaseWork { item_id, claimant } => self.release_work(&item_id, &claimant),
            HubRequest::UpdateStatus {
                item_id,
                claimant,
                status,
                progress,
                notes,
            } => self.update_status(connection, &item_id, &claimant, status, progress, notes),
            HubRequest::ListAvailable { epic_id } => Ok(self.list_available(epic_id.as_deref())),
            HubRequest::EpicProgress { epic_id } => Ok(self.epic_progress(&epic_id)),
            HubRequest::ClaimIdentity {
                name,
                role,
                project,
            } => self.claim_identity(connection, name, role, project),
            HubRequest::ListIdentities { project } => {
                let identities = self
                    .store
                    .identities()
                    .into_iter()
                    .filter(|identity| project.as_ref().map_or(true, |p| &identity.project == p))
                    .collect();
                Ok(HubReply::Identities { identities })
            }
            HubRequest::SubscribeWorkflow {
                project,
                role,
                agent_name,
                kinds,
            } => {
                let repeat = self.store.subscription(&project, connection).is_some();
                debug!(
                    connection = %connection,
                    project = %project,
                    role = %role,
                    agent = %agent_name,
                    repeat = repeat,
                    "Workflow subscription registered"
                );
                self.store.put_subscription(WorkflowSubscription {
                    project: project.clone(),
                    connection,
                    role,
                    agent_name,
                    kinds,
                });
                Ok(HubReply::Subscribed { project })
            }
            HubRequest::PublishTransition {
                item_id,
                old_status,
                new_status,
                actor,
                role,
                branch_ref,
                notes,
            } => {
                if !self.settings.transitions.allows(&old_status, &new_status) {
                    return Err(HubError::InvalidTransition {
                        from: old_status,
                        to: new_status,
                    });
                }
                let project = self.project_for_item(connection, &item_id);
                let notified = self.record_transition(
                    connection,
                    TransitionNotice {
                        project,
                        item_id,
                        old_status,
                        new_status,
                        actor,
                        role,
                        branch_ref,
                        notes,
                    },
                );
                Ok(HubReply::Published { notified })
            }
            HubRequest::ClaimReview {
                item_id,
                reviewer,
                review_type,
            } => self.claim_review(connection, item_id, reviewer, review_type),
            HubRequest::CompleteReview {
                item_id,
                reviewer,
                outcome,
                findings,
                branch_ref,
            } => self.complete_review(connection, item_id, reviewer, &outcome, findings, branch_ref),
            HubRequest::RegisterWork { item } => Ok(self.register_work(connection, item)),
            HubRequest::GetWork { item_id } => self
                .store
                .item(&item_id)
                .map(|item| HubReply::Item { item })
                .ok_or_else(|| HubError::not_found(format!("work item {item_id}"))),
            HubRequest::WorkflowStatus { item_id } => Ok(HubReply::Workflow {
                status: self.store.workflow_status(&item_id),
            }),
        }
    }

    fn claim_work(
        &mut self,
        connection: ConnectionId,
        item_id: String,
        claimant: String,
        epic_id: Option<String>,
        project: Option<String>,
        timeout_secs: Option<u64>,
    ) -> HubResult {
        let expires_at = match timeout_secs {
            Some(secs) => Some(
                Instant::now()
                    .checked_add(Duration::from_secs(secs))
                    .ok_or_else(|| HubError::malformed(format!("claim timeout of {secs}s is out of range")))?,
            ),
            None => None,
        };

        let mut item = match self.store.item(&item_id) {
            Some(item) => item,
            None => {
                let Some(epic_id) = epic_id else {
                    return Err(HubError::not_found(format!("work item {item_id}")));
                };
                let project = project.unwrap_or_else(|| self.caller_project(connection));
                debug!(item_id = %item_id, epic_id = %epic_id, project = %project, "Registering work item on first claim");
                WorkItem::new(
                    item_id.clone(),
                    epic_id,
                    project,
                    self.settings.vocabulary.available.clone(),
                )
            }
        };

        if let Some(holder) = item.claimed_by.as_ref().filter(|holder| **holder != claimant) {
            hub_metrics().record_claim_conflict();
            return Err(HubError::ClaimConflict {
                item_id,
                held_by: holder.clone(),
            });
        }

        let now = Utc::now();
        let fresh = !item.is_held_by(&claimant);
        if fresh {
            self.next_generation += 1;
            item.claimed_by = Some(claimant.clone());
            item.claimed_at = Some(now);
            item.claim_connection = Some(connection);
            item.claim_generation = self.next_generation;
            item.status = self.settings.vocabulary.claimed.clone();
            item.last_update = now;
            self.cancel_claim_timer(&item_id);
            info!(item_id = %item_id, claimant = %claimant, project = %item.project, "Work item claimed");
        }

        if let Some(expires_at) = expires_at {
            self.cancel_claim_timer(&item_id);
            let timer = self.timers.schedule(
                expires_at,
                ClaimTimer {
                    item_id: item_id.clone(),
                    claimant: claimant.clone(),
                    generation: item.claim_generation,
                    status: item.status.clone(),
                },
            );
            self.claim_timers.insert(item_id.clone(), timer);
            debug!(item_id = %item_id, timeout_secs = ?timeout_secs, "Auto-release armed");
        }

        self.store.put_item(item.clone());
        Ok(HubReply::Item { item })
    }

    fn release_work(&mut self, item_id: &str, claimant: &str) -> HubResult {
        let item = self
            .store
            .item(item_id)
            .ok_or_else(|| HubError::not_found(format!("work item {item_id}")))?;
        if !item.is_held_by(claimant) {
            return Err(HubError::NotOwner {
                item_id: item_id.to_string(),
                claimant: claimant.to_string(),
            });
        }
        info!(item_id = %item_id, claimant = %claimant, "Work item released");
        let item = self.clear_claim(item);
        Ok(HubReply::Item { item })
    }

    fn update_status(
        &mut self,
        connection: ConnectionId,
        item_id: &str,
        claimant: &str,
        status: String,
        progress: u8,
        notes: Option<String>,
    ) -> HubResult {
        let mut item = self
            .store
            .item(item_id)
            .ok_or_else(|| HubError::not_found(format!("work item {item_id}")))?;
        if !item.is_held_by(claimant) {
            return Err(HubError::NotOwner {
                item_id: item_id.to_string(),
                claimant: claimant.to_string(),
            });
        }

        item.status = status;
        item.progress = progress.min(100);
        item.notes = notes;
        item.last_update = Utc::now();
        self.store.put_item(item.clone());
        debug!(item_id = %item_id, status = %item.status, progress = item.progress, "Work item status updated");

        self.broadcast(
            Some(connection),
            HubEvent::ItemStatusUpdated {
                project: item.project.clone(),
                item: item.clone(),
            },
        );
        Ok(HubReply::Item { item })
    }

    fn list_available(&self, epic_id: Option<&str>) -> HubReply {
        let vocabulary = &self.settings.vocabulary;
        let items = self
            .store
            .items()
            .into_iter()
            .filter(|item| !item.is_claimed() && !vocabulary.is_completed(&item.status))
            .filter(|item| epic_id.map_or(true, |epic| item.epic_id == epic))
            .collect();
        HubReply::Items { items }
    }

    fn epic_progress(&self, epic_id: &str) -> HubReply {
        let vocabulary = &self.settings.vocabulary;
        let items: Vec<_> = self
            .store
            .items()
            .into_iter()
            .filter(|item| item.epic_id == epic_id)
            .collect();

        let total = items.len();
        let completed = items
            .iter()
            .filter(|item| vocabulary.is_completed(&item.status))
            .count();
        let in_progress = items
            .iter()
            .filter(|item| item.is_claimed() && !vocabulary.is_completed(&item.status))
            .count();
        let available = total - completed - in_progress;

        HubReply::Progress {
            progress: EpicProgress {
                epic_id: epic_id.to_string(),
                total,
                completed,
                in_progress,
                available,
                pct: EpicProgress::percentage(completed, total),
            },
        }
    }

    fn claim_identity(
        &mut self,
        connection: ConnectionId,
        name: String,
        role: String,
        project: String,
    ) -> HubResult {
        let existing = self.store.identity(&project, &name);
        if let Some(existing) = &existing {
            if existing.owner_connection != connection {
                return Err(HubError::NameTaken { project, name });
            }
        }

        if let Some(prior) = self.store.identity_for_connection(connection) {
            if prior.project != project || prior.name != name {
                self.store.remove_identity(&prior.project, &prior.name);
                info!(
                    previous = %prior.full_name(),
                    connection = %connection,
                    "Identity replaced by a new claim"
                );
                self.broadcast(
                    Some(connection),
                    HubEvent::IdentityReleased {
                        project: prior.project,
                        name: prior.name,
                        reason: IdentityReleaseReason::Replaced,
                    },
                );
            }
        }

        let identity = AgentIdentity {
            project: project.clone(),
            name: name.clone(),
            role: role.clone(),
            owner_connection: connection,
            claimed_at: existing.map_or_else(Utc::now, |existing| existing.claimed_at),
        };
        self.store.put_identity(identity.clone());
        info!(identity = %identity.full_name(), role = %role, connection = %connection, "Identity claimed");

        self.broadcast(
            Some(connection),
            HubEvent::IdentityClaimed {
                project: project.clone(),
                name: name.clone(),
                role,
            },
        );
        Ok(HubReply::Identity {
            full_name: full_identity_name(&project, &name),
            identity,
        })
    }

    fn claim_review(
        &mut self,
        connection: ConnectionId,
        item_id: String,
        reviewer: String,
        review_type: String,
    ) -> HubResult {
        if let Some(claim) = self.store.review(&item_id) {
            return Err(HubError::AlreadyClaimed {
                item_id,
                by: claim.reviewer,
            });
        }

        let old_status = self.current_status(&item_id);
        let in_review = self.settings.vocabulary.in_review.clone();
        if !self.settings.transitions.allows(&old_status, &in_review) {
            return Err(HubError::InvalidTransition {
                from: old_status,
                to: in_review,
            });
        }

        let claim = ReviewClaim {
            item_id: item_id.clone(),
            reviewer: reviewer.clone(),
            review_type: review_type.clone(),
            claimed_at: Utc::now(),
        };
        self.store.put_review(claim.clone());
        info!(item_id = %item_id, reviewer = %reviewer, review_type = %review_type, "Review claimed");

        let project = self.project_for_item(connection, &item_id);
        let role = self.caller_role(connection, "reviewer");
        self.record_transition(
            connection,
            TransitionNotice {
                project,
                item_id,
                old_status,
                new_status: in_review,
                actor: reviewer,
                role,
                branch_ref: None,
                notes: Some(format!("{review_type} review started")),
            },
        );
        Ok(HubReply::ReviewClaimed { claim })
    }

    fn complete_review(
        &mut self,
        connection: ConnectionId,
        item_id: String,
        reviewer: String,
        outcome: &str,
        findings: Vec<String>,
        branch_ref: Option<String>,
    ) -> HubResult {
        if let Some(claim) = self.store.review(&item_id) {
            if claim.reviewer != reviewer {
                return Err(HubError::NotOwner {
                    item_id,
                    claimant: reviewer,
                });
            }
        }

        let outcome = ReviewOutcome::parse(outcome);
        let status = self.settings.vocabulary.review_label(&outcome);
        let old_status = self.current_status(&item_id);
        if !self.settings.transitions.allows(&old_status, &status) {
            return Err(HubError::InvalidTransition {
                from: old_status,
                to: status,
            });
        }

        self.store.remove_review(&item_id);
        info!(item_id = %item_id, reviewer = %reviewer, outcome = %outcome, "Review completed");

        let project = self.project_for_item(connection, &item_id);
        let role = self.caller_role(connection, "reviewer");
        let notes = (!findings.is_empty()).then(|| findings.join("; "));
        self.broadcast(
            Some(connection),
            HubEvent::ReviewCompleted {
                project: project.clone(),
                item_id: item_id.clone(),
                reviewer: reviewer.clone(),
                outcome,
                status: status.clone(),
                findings,
                branch_ref: branch_ref.clone(),
            },
        );
        self.record_transition(
            connection,
            TransitionNotice {
                project,
                item_id,
                old_status,
                new_status: status.clone(),
                actor: reviewer,
                role,
                branch_ref,
                notes,
            },
        );
        Ok(HubReply::ReviewCompleted { status })
    }

    fn register_work(&mut self, connection: ConnectionId, new_item: NewWorkItem) -> HubReply {
        let item = match self.store.item(&new_item.id) {
            Some(mut item) => {
                item.epic_id = new_item.epic_id;
                if let Some(project) = new_item.project {
                    item.project = project;
                }
                if let Some(status) = new_item.status.filter(|_| !item.is_claimed()) {
                    item.status = status;
                }
                item.last_update = Utc::now();
                item
            }
            None => {
                let project = new_item
                    .project
                    .unwrap_or_else(|| self.caller_project(connection));
                let status = new_item
                    .status
                    .unwrap_or_else(|| self.settings.vocabulary.available.clone());
                WorkItem::new(new_item.id, new_item.epic_id, project, status)
            }
        };
        debug!(item_id = %item.id, epic_id = %item.epic_id, project = %item.project, "Work item registered");
        self.store.put_item(item.clone());
        HubReply::Item { item }
    }

    /// Store the snapshot, move a registered item to the new status, then
    /// fan out the transition and any targeted notification. Returns the
    /// number of connections that received the transition broadcast.
    fn record_transition(&mut self, origin: ConnectionId, notice: TransitionNotice) -> usize {
        let now = Utc::now();
        self.store.put_workflow_status(WorkflowStatus {
            item_id: notice.item_id.clone(),
            project: notice.project.clone(),
            status: notice.new_status.clone(),
            previous_status: notice.old_status.clone(),
            actor: notice.actor.clone(),
            role: notice.role.clone(),
            branch_ref: notice.branch_ref.clone(),
            notes: notice.notes.clone(),
            updated_at: now,
        });

        if let Some(mut item) = self.store.item(&notice.item_id) {
            item.status = notice.new_status.clone();
            item.last_update = now;
            self.store.put_item(item);
        }

        info!(
            item_id = %notice.item_id,
            project = %notice.project,
            from = %notice.old_status,
            to = %notice.new_status,
            actor = %notice.actor,
            "Workflow transition published"
        );

        let notified = self.broadcast(Some(origin), HubEvent::Transition(notice.clone()));

        match self.settings.vocabulary.signal(&notice.new_status) {
            StatusSignal::ReadyForReview => {
                self.notify_roles(origin, Some(RoleClass::Reviewer), HubEvent::ReviewRequested(notice));
            }
            StatusSignal::NeedsChanges => {
                self.notify_roles(origin, Some(RoleClass::Developer), HubEvent::ChangesRequested(notice));
            }
            StatusSignal::Approved => {
                self.notify_roles(origin, None, HubEvent::Approved(notice));
            }
            StatusSignal::Other => {}
        }

        notified
    }

    /// Release the claim on `item`, keeping review and completed statuses
    fn clear_claim(&mut self, mut item: WorkItem) -> WorkItem {
        let vocabulary = &self.settings.vocabulary;
        if !vocabulary.is_review_state(&item.status) && !vocabulary.is_completed(&item.status) {
            item.status = vocabulary.available.clone();
        }
        item.claimed_by = None;
        item.claimed_at = None;
        item.claim_connection = None;
        item.last_update = Utc::now();
        self.cancel_claim_timer(&item.id);
        self.store.put_item(item.clone());
        item
    }

    fn cancel_claim_timer(&mut self, item_id: &str) {
        if let Some(timer) = self.claim_timers.remove(item_id) {
            self.timers.cancel(timer);
        }
    }

    /// Every connection that is a member of `project`, with the role it is
    /// known by there. A subscription's role wins over the identity's.
    fn members(&self, project: &str) -> BTreeMap<ConnectionId, Member> {
        let mut members = BTreeMap::new();
        for identity in self
            .store
            .identities()
            .into_iter()
            .filter(|identity| identity.project == project)
        {
            members.insert(
                identity.owner_connection,
                Member {
                    role: identity.role,
                    subscription: None,
                },
            );
        }
        for subscription in self.store.subscriptions(project) {
            members.insert(
                subscription.connection,
                Member {
                    role: subscription.role.clone(),
                    subscription: Some(subscription),
                },
            );
        }
        members
    }

    /// Deliver `event` to every member of its project except `origin`.
    /// Returns the number of connections it reached.
    fn broadcast(&self, origin: Option<ConnectionId>, event: HubEvent) -> usize {
        self.deliver(origin, event, |_| true)
    }

    /// Targeted notification: members whose role falls in `class`, or all
    /// members when `class` is `None`
    fn notify_roles(&self, origin: ConnectionId, class: Option<RoleClass>, event: HubEvent) -> usize {
        let vocabulary = &self.settings.vocabulary;
        self.deliver(Some(origin), event, |member| {
            class.map_or(true, |class| vocabulary.role_class(&member.role) == class)
        })
    }

    fn deliver(
        &self,
        origin: Option<ConnectionId>,
        event: HubEvent,
        wanted: impl Fn(&Member) -> bool,
    ) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for (connection, member) in self.members(event.project()) {
            if Some(connection) == origin || !wanted(&member) {
                continue;
            }
            if member
                .subscription
                .as_ref()
                .is_some_and(|subscription| !subscription.accepts(kind))
            {
                continue;
            }
            let Some(sender) = self.connections.get(&connection) else {
                continue;
            };
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(connection = %connection, event = %kind, "Dropping event for closed connection");
            }
        }
        hub_metrics().record_events_delivered(delivered);
        delivered
    }

    fn caller_project(&self, connection: ConnectionId) -> String {
        self.store
            .identity_for_connection(connection)
            .map(|identity| identity.project)
            .unwrap_or_else(|| self.settings.default_project.clone())
    }

    fn caller_role(&self, connection: ConnectionId, fallback: &str) -> String {
        self.store
            .identity_for_connection(connection)
            .map(|identity| identity.role)
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Registered items broadcast in their own project, items with a workflow
    /// history in the project of their last transition, anything else in the
    /// caller's
    fn project_for_item(&self, connection: ConnectionId, item_id: &str) -> String {
        self.store
            .item(item_id)
            .map(|item| item.project)
            .or_else(|| {
                self.store
                    .workflow_status(item_id)
                    .map(|snapshot| snapshot.project)
            })
            .unwrap_or_else(|| self.caller_project(connection))
    }

    fn current_status(&self, item_id: &str) -> String {
        self.store
            .item(item_id)
            .map(|item| item.status)
            .or_else(|| {
                self.store
                    .workflow_status(item_id)
                    .map(|snapshot| snapshot.status)
            })
            .unwrap_or_else(|| self.settings.vocabulary.available.clone())
    }
}

struct Member {
    role: String,
    subscription: Option<WorkflowSubscription>,
}
