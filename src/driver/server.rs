use std::{net::SocketAddr, sync::Arc};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{DataMode, EVENT_QUEUE_CAPACITY, RECV_BUFFER_CAPACITY, SEND_QUEUE_CAPACITY, frame};
use crate::{
    Payload,
    error::{Error, ErrorKind, Result},
};

/// Identifier of one accepted connection, unique per server instance.
pub type ClientId = u64;

/// Event delivered by a [`SocketServer`].
#[derive(Debug)]
pub enum ServerEvent {
    ClientConnected(ClientId),
    /// One complete frame received from a client, framing stripped.
    ClientDataRecv(ClientId, Payload),
    ClientDisconnected(ClientId),
}

/// Write access to the connected clients of a [`SocketServer`].
///
/// Clonable and holds no shutdown state, so it can be kept by tasks that
/// must not prolong the server's lifetime.
#[derive(Clone)]
pub struct ServerWriter {
    mode: DataMode,
    clients: Arc<DashMap<ClientId, mpsc::Sender<Bytes>, RandomState>>,
}

impl ServerWriter {
    /// Frames the payload and queues it for every connected client.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when no client accepted the frame and
    /// `FrameTooLong` for oversized payloads.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let framed = frame::encode_frame(self.mode, &data.into())?;
        let mut sent = false;
        for entry in self.clients.iter() {
            match entry.value().try_send(framed.clone()) {
                Ok(()) => sent = true,
                Err(e) => {
                    tracing::error!("cannot send data to client {}: {e}", entry.key());
                }
            }
        }
        if sent {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::NotConnected,
                "no connected client".to_string(),
            ))
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Server side of a framed TCP endpoint.
///
/// `start` binds a listener and spawns an accept loop. Each accepted client
/// gets its own send and recv loops; frames and connection changes surface
/// as [`ServerEvent`]s on the returned channel. Connections beyond the
/// client limit are accepted and immediately closed.
pub struct SocketServer {
    writer: ServerWriter,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    _drop_guard: DropGuard,
}

impl SocketServer {
    /// Binds and starts accepting up to `max_clients` concurrent clients.
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the address cannot be bound.
    pub async fn start(
        mode: DataMode,
        addr: SocketAddr,
        max_clients: usize,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let clients: Arc<DashMap<ClientId, mpsc::Sender<Bytes>, RandomState>> =
            Arc::new(DashMap::default());

        tokio::spawn({
            let cancel = cancel.clone();
            let clients = Arc::clone(&clients);
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::info!("stop accept loop on {local_addr}");
                    }
                    () = accept_loop(listener, mode, max_clients, &clients, &event_tx, &cancel) => {}
                }
            }
        });

        let server = Self {
            writer: ServerWriter { mode, clients },
            local_addr,
            _drop_guard: cancel.clone().drop_guard(),
            cancel,
        };
        Ok((server, event_rx))
    }

    /// Stops accepting and closes all connections. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.writer.clients.clear();
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.writer.client_count()
    }

    /// Returns a write handle that does not pin the server's lifetime.
    #[must_use]
    pub fn writer(&self) -> ServerWriter {
        self.writer.clone()
    }

    /// Frames the payload and queues it for every connected client.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when no client accepted the frame and
    /// `FrameTooLong` for oversized payloads.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.writer.write(data)
    }
}

impl std::fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketServer")
            .field("mode", &self.writer.mode)
            .field("local_addr", &self.local_addr)
            .field("clients", &self.client_count())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    mode: DataMode,
    max_clients: usize,
    clients: &Arc<DashMap<ClientId, mpsc::Sender<Bytes>, RandomState>>,
    events: &mpsc::Sender<ServerEvent>,
    cancel: &CancellationToken,
) {
    let mut next_id: ClientId = 0;
    while let Ok((stream, peer)) = listener.accept().await {
        if clients.len() >= max_clients {
            tracing::warn!("refusing connection from {peer}: client limit reached");
            drop(stream);
            continue;
        }

        next_id += 1;
        let id = next_id;
        tracing::info!("client {id} connected from {peer}");
        start_client(id, stream, mode, clients, events, cancel);
        let _ = events.send(ServerEvent::ClientConnected(id)).await;
    }
}

fn start_client(
    id: ClientId,
    stream: TcpStream,
    mode: DataMode,
    clients: &Arc<DashMap<ClientId, mpsc::Sender<Bytes>, RandomState>>,
    events: &mpsc::Sender<ServerEvent>,
    cancel: &CancellationToken,
) {
    let (recv_stream, send_stream) = stream.into_split();
    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    clients.insert(id, send_tx);

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                r = send_loop(send_stream, send_rx) => {
                    if let Err(e) = r {
                        tracing::error!("send loop for client {id} failed: {e}");
                    }
                }
            }
        }
    });

    tokio::spawn({
        let cancel = cancel.clone();
        let clients = Arc::clone(clients);
        let events = events.clone();
        async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                r = recv_loop(id, recv_stream, mode, &events) => {
                    clients.remove(&id);
                    if let Err(e) = r {
                        tracing::info!("client {id} disconnected: {e}");
                        let _ = events.send(ServerEvent::ClientDisconnected(id)).await;
                    }
                }
            }
        }
    });
}

async fn recv_loop(
    id: ClientId,
    mut stream: OwnedReadHalf,
    mode: DataMode,
    events: &mpsc::Sender<ServerEvent>,
) -> Result<()> {
    let mut buffer = BytesMut::with_capacity(RECV_BUFFER_CAPACITY);
    loop {
        if let Some(bytes) = frame::extract_frame(mode, &mut buffer)? {
            if events
                .send(ServerEvent::ClientDataRecv(id, bytes.into()))
                .await
                .is_err()
            {
                return Ok(());
            }
        } else {
            let n = stream
                .read_buf(&mut buffer)
                .await
                .map_err(|e| Error::new(ErrorKind::RecvFailed, e.to_string()))?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::ConnectionClosed,
                    "connection closed by client".to_string(),
                ));
            }
        }
    }
}

async fn send_loop(mut stream: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) -> Result<()> {
    while let Some(bytes) = queue.recv().await {
        stream
            .write_all(&bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))?;
    }
    Ok(())
}
