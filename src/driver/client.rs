use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
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

/// Event delivered by a [`SocketClient`] connection.
#[derive(Debug)]
pub enum ClientEvent {
    /// One complete frame received from the server, framing stripped.
    ServerDataRecv(Payload),
    /// The server closed the connection or the stream failed.
    ServerDisconnected,
}

/// Client side of a framed TCP connection.
///
/// `connect` spawns a send loop (fed through an internal queue) and a recv
/// loop that reassembles frames and forwards them as [`ClientEvent`]s on the
/// returned channel. Dropping the client tears both loops down.
pub struct SocketClient {
    mode: DataMode,
    connected: Arc<AtomicBool>,
    sender: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    _drop_guard: DropGuard,
}

impl SocketClient {
    /// Connects to a server speaking the given framing mode.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` if the TCP connection cannot be established.
    pub async fn connect(
        mode: DataMode,
        addr: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))?;
        let (recv_stream, send_stream) = stream.into_split();

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    r = send_loop(send_stream, send_rx) => {
                        if let Err(e) = r {
                            tracing::error!("send loop for {addr} failed: {e}");
                        }
                    }
                }
            }
        });

        tokio::spawn({
            let cancel = cancel.clone();
            let connected = Arc::clone(&connected);
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {
                        connected.store(false, Ordering::Release);
                    }
                    r = recv_loop(recv_stream, mode, &event_tx) => {
                        connected.store(false, Ordering::Release);
                        if let Err(e) = r {
                            tracing::info!("connection to {addr} closed: {e}");
                            let _ = event_tx.send(ClientEvent::ServerDisconnected).await;
                        }
                    }
                }
            }
        });

        let client = Self {
            mode,
            connected,
            sender: send_tx,
            _drop_guard: cancel.clone().drop_guard(),
            cancel,
        };
        Ok((client, event_rx))
    }

    /// Closes the connection. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Frames the payload and queues it for sending.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the connection is down, `FrameTooLong`
    /// for oversized payloads and `SendFailed` when the send queue is
    /// unavailable.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::kind(ErrorKind::NotConnected));
        }
        let framed = frame::encode_frame(self.mode, &data.into())?;
        self.sender
            .try_send(framed)
            .map_err(|e| Error::new(ErrorKind::SendFailed, e.to_string()))
    }
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("mode", &self.mode)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn recv_loop(
    mut stream: OwnedReadHalf,
    mode: DataMode,
    events: &mpsc::Sender<ClientEvent>,
) -> Result<()> {
    let mut buffer = BytesMut::with_capacity(RECV_BUFFER_CAPACITY);
    loop {
        if let Some(bytes) = frame::extract_frame(mode, &mut buffer)? {
            if events
                .send(ClientEvent::ServerDataRecv(bytes.into()))
                .await
                .is_err()
            {
                // consumer is gone, stop reading
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
                    "connection closed by server".to_string(),
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
