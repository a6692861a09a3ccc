// soda-hub library - project-scoped agent coordination hub and lifecycle orchestrator
// This exposes the core components for testing and integration

pub mod client;
pub mod config;
pub mod hub;
pub mod observability;
pub mod orchestrator;
pub mod priority;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use client::{ClaimOptions, CoordinationClient, Transition};
pub use config::SodaHubConfig;
pub use hub::{
    start_hub, AgentIdentity, EventKind, Hub, HubError, HubEvent, HubHandle, HubReply, HubRequest,
    HubServer, HubSettings, NewWorkItem, ReviewClaim, ReviewOutcome, WorkItem, WorkflowStatus,
};
pub use observability::{hub_metrics, HubMetrics, HubStats};
pub use orchestrator::{
    Collaborators, Orchestrator, OrchestratorError, OrchestratorSettings, OrchestratorSnapshot,
    SpawnOutcome, SpawnRequest,
};
pub use priority::Priority;
pub use scheduler::DeadlineScheduler;
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
