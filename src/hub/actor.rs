// Hub actor: one task owns the Hub and serializes every mutation

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::core::Hub;
use super::errors::HubError;
use super::events::HubEvent;
use super::protocol::{HubRequest, HubResult};
use super::types::ConnectionId;
use crate::scheduler::sleep_until_deadline;

const COMMAND_BUFFER: usize = 256;

enum HubCommand {
    Connect {
        events: mpsc::UnboundedSender<HubEvent>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Request {
        connection: ConnectionId,
        request: HubRequest,
        reply: oneshot::Sender<HubResult>,
    },
    Disconnect {
        connection: ConnectionId,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to a running hub actor
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubCommand::Connect { .. } => write!(f, "Connect"),
            HubCommand::Request { connection, request, .. } => {
                write!(f, "Request({connection}, {})", request.operation())
            }
            HubCommand::Disconnect { connection } => write!(f, "Disconnect({connection})"),
            HubCommand::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

impl HubHandle {
    /// Start the actor task for `hub`
    pub fn spawn(hub: Hub) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(run_hub(hub, receiver));
        (Self { commands }, task)
    }

    /// Open a connection; broadcasts for it arrive on the returned receiver
    pub async fn connect(
        &self,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<HubEvent>), HubError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Connect { events, reply })
            .await
            .map_err(|_| HubError::Disconnected)?;
        let connection = response.await.map_err(|_| HubError::Disconnected)?;
        Ok((connection, receiver))
    }

    pub async fn request(&self, connection: ConnectionId, request: HubRequest) -> HubResult {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(HubCommand::Request {
                connection,
                request,
                reply,
            })
            .await
            .map_err(|_| HubError::Disconnected)?;
        response.await.map_err(|_| HubError::Disconnected)?
    }

    /// Detach a connection. A hub that already stopped is not an error.
    pub async fn disconnect(&self, connection: ConnectionId) {
        let _ = self
            .commands
            .send(HubCommand::Disconnect { connection })
            .await;
    }

    /// Stop the actor and wait until it has exited its loop
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(HubCommand::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
    }
}

async fn run_hub(mut hub: Hub, mut commands: mpsc::Receiver<HubCommand>) {
    info!(
        project = %hub.settings().default_project,
        "Coordination hub started"
    );

    loop {
        let deadline = hub.next_deadline();
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    HubCommand::Connect { events, reply } => {
                        let connection = hub.attach(events);
                        if reply.send(connection).is_err() {
                            // Caller went away before learning its id
                            hub.detach(connection);
                        }
                    }
                    HubCommand::Request { connection, request, reply } => {
                        let result = hub.handle(connection, request);
                        if reply.send(result).is_err() {
                            debug!(connection = %connection, "Requester dropped before reply");
                        }
                    }
                    HubCommand::Disconnect { connection } => hub.detach(connection),
                    HubCommand::Shutdown { done } => {
                        let _ = done.send(());
                        break;
                    }
                }
            }

            _ = sleep_until_deadline(deadline) => {
                hub.fire_expired(Instant::now());
            }
        }
    }

    info!("Coordination hub stopped");
}
