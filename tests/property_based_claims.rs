// Property-based tests for claim arbitration and admission order
// Random operation sequences are checked against a plain ownership model

use proptest::prelude::*;
use proptest_derive::Arbitrary;
use std::collections::HashMap;
use tokio::sync::mpsc;

use soda_hub::config::HubConfig;
use soda_hub::hub::{ConnectionId, Hub, HubError, HubReply, HubRequest, HubSettings};
use soda_hub::orchestrator::PendingQueue;
use soda_hub::Priority;

#[derive(Debug, Clone, Copy, Arbitrary)]
enum Action {
    Claim,
    Release,
    Update,
}

#[derive(Debug, Clone, Arbitrary)]
struct Step {
    action: Action,
    #[proptest(strategy = "0usize..3")]
    item: usize,
    #[proptest(strategy = "0usize..4")]
    agent: usize,
}

#[derive(Debug, Clone, Copy, Arbitrary)]
enum Tier {
    Low,
    Medium,
    High,
}

impl From<Tier> for Priority {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Low => Priority::Low,
            Tier::Medium => Priority::Medium,
            Tier::High => Priority::High,
        }
    }
}

fn hub_with_agents(count: usize) -> (Hub, Vec<ConnectionId>) {
    let settings = HubSettings::from_config(&HubConfig::default()).unwrap();
    let mut hub = Hub::in_memory(settings);
    let connections = (0..count)
        .map(|_| {
            let (events, _receiver) = mpsc::unbounded_channel();
            hub.attach(events)
        })
        .collect();
    (hub, connections)
}

proptest! {
    #[test]
    fn claims_follow_the_ownership_model(steps in prop::collection::vec(any::<Step>(), 1..60)) {
        let (mut hub, connections) = hub_with_agents(4);
        let mut owners: HashMap<String, String> = HashMap::new();

        for step in steps {
            let item_id = format!("1.{}", step.item);
            let claimant = format!("agent-{}", step.agent);
            let connection = connections[step.agent];
            let holder = owners.get(&item_id).cloned();

            match step.action {
                Action::Claim => {
                    let result = hub.handle(connection, HubRequest::ClaimWork {
                        item_id: item_id.clone(),
                        claimant: claimant.clone(),
                        epic_id: Some("1".to_string()),
                        project: None,
                        timeout_secs: None,
                    });
                    match holder {
                        Some(held_by) if held_by != claimant => {
                            prop_assert_eq!(result, Err(HubError::ClaimConflict { item_id: item_id.clone(), held_by }));
                        }
                        _ => {
                            let Ok(HubReply::Item { item }) = result else {
                                return Err(TestCaseError::fail("claim should succeed"));
                            };
                            prop_assert_eq!(item.claimed_by.as_deref(), Some(claimant.as_str()));
                            owners.insert(item_id.clone(), claimant.clone());
                        }
                    }
                }
                Action::Release => {
                    let result = hub.handle(connection, HubRequest::ReleaseWork {
                        item_id: item_id.clone(),
                        claimant: claimant.clone(),
                    });
                    if holder.as_deref() == Some(claimant.as_str()) {
                        prop_assert!(result.is_ok());
                        owners.remove(&item_id);
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
                Action::Update => {
                    let result = hub.handle(connection, HubRequest::UpdateStatus {
                        item_id: item_id.clone(),
                        claimant: claimant.clone(),
                        status: "in-progress".to_string(),
                        progress: 50,
                        notes: None,
                    });
                    prop_assert_eq!(result.is_ok(), holder.as_deref() == Some(claimant.as_str()));
                }
            }

            // The hub's view of the item always matches the model
            let stored = hub.handle(connection, HubRequest::GetWork { item_id: item_id.clone() });
            match stored {
                Ok(HubReply::Item { item }) => {
                    prop_assert_eq!(item.claimed_by, owners.get(&item_id).cloned());
                }
                Err(HubError::NotFound { .. }) => prop_assert!(!owners.contains_key(&item_id)),
                other => return Err(TestCaseError::fail(format!("unexpected reply {other:?}"))),
            }
        }
    }

    #[test]
    fn queue_admits_by_priority_then_arrival(tiers in prop::collection::vec(any::<Tier>(), 0..40)) {
        let mut queue = PendingQueue::new();
        for (arrival, tier) in tiers.iter().enumerate() {
            queue.push(Priority::from(*tier), arrival);
        }

        let admitted: Vec<(Priority, usize)> = queue.drain();
        prop_assert_eq!(admitted.len(), tiers.len());
        for pair in admitted.windows(2) {
            let (first, second) = (pair[0], pair[1]);
            prop_assert!(first.0 > second.0 || (first.0 == second.0 && first.1 < second.1));
        }
    }
}
