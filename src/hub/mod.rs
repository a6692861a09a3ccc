//! Coordination hub: claims, identities, reviews and project-scoped broadcasts

pub mod actor;
pub mod core;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod types;
pub mod vocabulary;

pub use actor::HubHandle;
pub use self::core::{Hub, HubSettings};
pub use errors::HubError;
pub use events::{EventKind, HubEvent, IdentityReleaseReason, ReleaseReason, TransitionNotice};
pub use protocol::{HubReply, HubRequest, HubResult};
pub use registry::{InMemoryRegistry, RegistryStore};
pub use server::HubServer;
pub use types::{
    AgentIdentity, ConnectionId, EpicProgress, NewWorkItem, ReviewClaim, ReviewOutcome, WorkItem,
    WorkflowStatus, WorkflowSubscription,
};

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::config::HubConfig;

/// Build an in-memory hub from configuration and start its actor
pub fn start_hub(config: &HubConfig) -> Result<(HubHandle, JoinHandle<()>)> {
    let settings = HubSettings::from_config(config)?;
    Ok(HubHandle::spawn(Hub::in_memory(settings)))
}
