use anyhow::Result;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::hub::HubHandle;
use crate::telemetry::shutdown_telemetry;
use crate::orchestrator::Orchestrator;

/// Graceful shutdown coordinator for soda-hub
#[derive(Default)]
pub struct ShutdownCoordinator {
    orchestrator: Option<Orchestrator>,
    hub: Option<HubHandle>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop this orchestrator first on shutdown
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_hub(mut self, hub: HubHandle) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Wait for SIGINT/SIGTERM
    pub async fn wait_for_signal() -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = signal(SignalKind::terminate())?;
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        info!("Shutdown signal received");
        Ok(())
    }

    /// Stop the orchestrator, then the hub, each under a timeout
    pub async fn shutdown_all_services(self) -> Result<()> {
        info!("Initiating graceful shutdown of all services...");

        if let Some(orchestrator) = self.orchestrator {
            if let Err(e) = stop_orchestrator(orchestrator).await {
                warn!("Orchestrator did not stop cleanly: {}", e);
            }
        }

        if let Some(hub) = self.hub {
            if let Err(e) = stop_hub(hub).await {
                warn!("Hub did not stop cleanly: {}", e);
            }
        }

        shutdown_telemetry();

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}

/// Fail active runs and release their claims
async fn stop_orchestrator(orchestrator: Orchestrator) -> Result<()> {
    info!("Stopping lifecycle orchestrator...");

    timeout(Duration::from_secs(60), orchestrator.shutdown())
        .await
        .map_err(|_| anyhow::anyhow!("Timeout waiting for orchestrator to stop"))??;

    info!("Lifecycle orchestrator stopped");
    Ok(())
}

async fn stop_hub(hub: HubHandle) -> Result<()> {
    info!("Stopping coordination hub...");

    timeout(Duration::from_secs(5), hub.shutdown())
        .await
        .map_err(|_| anyhow::anyhow!("Timeout waiting for hub to stop"))?;

    info!("Coordination hub stopped");
    Ok(())
}
