//! Framed TCP transport.
//!
//! Accepting and socket I/O run on their own tasks; everything they learn
//! funnels through one event channel that the driver drains each tick, so
//! the connected-client snapshot is only ever mutated on the driver.
//!
//! Client connection ids are minted here, monotonically from 1. The id a
//! client writes into its own frames is ignored; the connection's id is
//! authoritative.

use std::io;

use anvil_proto::{ClientId, Frame, MAX_FRAME_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};

enum NetEvent {
    Connected {
        client_id: ClientId,
        outbound: mpsc::UnboundedSender<Frame>,
    },
    Disconnected {
        client_id: ClientId,
    },
    Message {
        client_id: ClientId,
        frame: Frame,
    },
}

pub struct NetworkServer {
    events: mpsc::UnboundedReceiver<NetEvent>,
    /// Connected clients in connection order.
    clients: Vec<(ClientId, mpsc::UnboundedSender<Frame>)>,
    accept: JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl NetworkServer {
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| ServerError::Bind {
                port,
                message: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            port,
            message: e.to_string(),
        })?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let accept = tokio::spawn(accept_loop(listener, event_tx));

        Ok(Self {
            events,
            clients: Vec::new(),
            accept,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn connected_clients(&self) -> Vec<ClientId> {
        self.clients.iter().map(|(id, _)| *id).collect()
    }

    /// Apply buffered connection changes and return the inbound messages.
    pub fn pump(&mut self) -> Vec<(ClientId, Frame)> {
        let mut messages = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            match event {
                NetEvent::Connected {
                    client_id,
                    outbound,
                } => {
                    debug!(client_id, "client connected");
                    self.clients.push((client_id, outbound));
                }
                NetEvent::Disconnected { client_id } => {
                    debug!(client_id, "client disconnected");
                    self.clients.retain(|(id, _)| *id != client_id);
                }
                NetEvent::Message { client_id, frame } => messages.push((client_id, frame)),
            }
        }
        messages
    }

    /// Queue a frame for one client. Dead connections are dropped on their
    /// next disconnect event; a failed send here is not an error.
    pub fn send(&self, client_id: ClientId, frame: Frame) {
        if let Some((_, outbound)) = self.clients.iter().find(|(id, _)| *id == client_id) {
            let _ = outbound.send(frame);
        }
    }

    pub fn shutdown(&mut self) {
        self.accept.abort();
        // Dropping the senders closes every writer task.
        self.clients.clear();
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<NetEvent>) {
    let mut next_client_id: ClientId = 1;
    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let client_id = next_client_id;
        next_client_id += 1;
        debug!(client_id, peer = %peer_addr, "new connection");

        let (read_half, write_half) = socket.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        if events
            .send(NetEvent::Connected {
                client_id,
                outbound: outbound_tx,
            })
            .is_err()
        {
            // Driver is gone; stop accepting.
            return;
        }

        tokio::spawn(write_loop(write_half, outbound_rx));
        tokio::spawn(read_loop(read_half, client_id, events.clone()));
    }
}

async fn read_loop(
    mut read: OwnedReadHalf,
    client_id: ClientId,
    events: mpsc::UnboundedSender<NetEvent>,
) {
    loop {
        match read_frame(&mut read).await {
            Ok(Some(mut frame)) => {
                frame.client_id = client_id;
                if events
                    .send(NetEvent::Message { client_id, frame })
                    .is_err()
                {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(client_id, error = %e, "client read error");
                break;
            }
        }
    }
    let _ = events.send(NetEvent::Disconnected { client_id });
}

async fn write_loop(mut write: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        if write.write_all(&frame.encode()).await.is_err() {
            break;
        }
    }
}

/// Read one frame. `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf);
    if len < 8 || len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {len}"),
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Frame::decode_body(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode()).await
}
