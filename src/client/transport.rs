//! Hub transports: in-process actor channel and newline-delimited JSON over TCP

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::hub::protocol::{ClientFrame, ServerFrame};
use crate::hub::{ConnectionId, HubError, HubEvent, HubHandle, HubRequest, HubResult};

/// One persistent channel to the hub
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait HubTransport: Send + Sync {
    async fn call(&self, request: HubRequest) -> HubResult;
    async fn close(&self);
}

/// Connection to a hub actor in the same process
pub struct LocalTransport {
    hub: HubHandle,
    connection: ConnectionId,
}

impl LocalTransport {
    pub async fn connect(
        hub: HubHandle,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HubEvent>), HubError> {
        let (connection, events) = hub.connect().await?;
        Ok((Self { hub, connection }, events))
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

#[async_trait]
impl HubTransport for LocalTransport {
    async fn call(&self, request: HubRequest) -> HubResult {
        self.hub.request(self.connection, request).await
    }

    async fn close(&self) {
        self.hub.disconnect(self.connection).await;
    }
}

/// Calls waiting for their response frame. Once the reader stops, `closed`
/// is set under the same lock so no new waiter can be left behind.
#[derive(Default)]
struct PendingCalls {
    waiters: HashMap<u64, oneshot::Sender<HubResult>>,
    closed: bool,
}

type Pending = Arc<Mutex<PendingCalls>>;

/// Connection to a remote hub server.
///
/// Requests are matched to responses by frame id; events are forwarded to
/// the receiver returned from [`TcpTransport::connect`].
pub struct TcpTransport {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl TcpTransport {
    pub async fn connect(
        address: &str,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<HubEvent>)> {
        let stream = TcpStream::connect(address).await?;
        let (reader, writer) = stream.into_split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(PendingCalls::default()));

        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Hub connection read failed");
                        break;
                    }
                };
                match serde_json::from_str::<ServerFrame>(&line) {
                    Ok(ServerFrame::Response { id: Some(id), result }) => {
                        if let Some(waiter) = reader_pending.lock().await.waiters.remove(&id) {
                            let _ = waiter.send(result);
                        }
                    }
                    Ok(ServerFrame::Response { id: None, result }) => {
                        warn!(?result, "Hub answered a frame it could not identify");
                    }
                    Ok(ServerFrame::Event { event }) => {
                        let _ = events_tx.send(event);
                    }
                    Err(e) => warn!(error = %e, "Ignoring unreadable frame from hub"),
                }
            }
            // Fail every outstanding call; dropping the senders does that
            let mut pending = reader_pending.lock().await;
            pending.closed = true;
            pending.waiters.clear();
            drop(pending);
            debug!("Hub connection reader stopped");
        });

        Ok((
            Self {
                writer: Mutex::new(writer),
                pending,
                next_id: AtomicU64::new(1),
                reader,
            },
            events_rx,
        ))
    }
}

#[async_trait]
impl HubTransport for TcpTransport {
    async fn call(&self, request: HubRequest) -> HubResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&ClientFrame { id, request })
            .map_err(HubError::malformed)?;
        line.push('\n');

        let (reply, response) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(HubError::Disconnected);
            }
            pending.waiters.insert(id, reply);
        }
        if self
            .writer
            .lock()
            .await
            .write_all(line.as_bytes())
            .await
            .is_err()
        {
            self.pending.lock().await.waiters.remove(&id);
            return Err(HubError::Disconnected);
        }

        response.await.map_err(|_| HubError::Disconnected)?
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_calls_after_the_hub_hangs_up_fail_instead_of_waiting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let (transport, _events) = TcpTransport::connect(&address).await.unwrap();
        server.await.unwrap();
        for _ in 0..100 {
            if transport.pending.lock().await.closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(transport.pending.lock().await.closed);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.call(HubRequest::ListAvailable { epic_id: None }),
        )
        .await
        .expect("call must not hang once the reader has stopped");
        assert_eq!(result, Err(HubError::Disconnected));
        assert!(transport.pending.lock().await.waiters.is_empty());
    }
}
