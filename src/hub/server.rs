//! TCP front end for the hub.
//!
//! Each accepted socket becomes one hub connection. Lines in are
//! [`ClientFrame`](super::protocol::ClientFrame)s, lines out are
//! [`ServerFrame`]s; broadcasts are interleaved with responses as they arrive.
//! A bad line is answered with `MalformedRequest` and the socket stays open.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::actor::HubHandle;
use super::protocol::{decode_client_line, ServerFrame};

pub struct HubServer {
    listener: TcpListener,
    hub: HubHandle,
}

impl HubServer {
    pub async fn bind(address: &str, hub: HubHandle) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind hub server to {address}"))?;
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> Result<()> {
        info!(address = %self.local_addr()?, "Hub server listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer, hub).await {
                    warn!(peer = %peer, error = %e, "Hub connection ended with error");
                }
            });
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, hub: HubHandle) -> Result<()> {
    let (connection, mut events) = hub.connect().await?;
    info!(peer = %peer, connection = %connection, "Client connected");

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let outcome: Result<()> = async {
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        break;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let frame = match decode_client_line(&line) {
                        Ok(frame) => ServerFrame::Response {
                            id: Some(frame.id),
                            result: hub.request(connection, frame.request).await,
                        },
                        Err((id, error)) => {
                            debug!(connection = %connection, error = %error, "Rejecting malformed line");
                            ServerFrame::Response { id, result: Err(error) }
                        }
                    };
                    write_frame(&mut writer, &frame).await?;
                }

                Some(event) = events.recv() => {
                    write_frame(&mut writer, &ServerFrame::Event { event }).await?;
                }
            }
        }
        Ok(())
    }
    .await;

    hub.disconnect(connection).await;
    info!(peer = %peer, connection = %connection, "Client disconnected");
    outcome
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &ServerFrame) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(())
}
