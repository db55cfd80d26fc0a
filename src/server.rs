use std::{net::SocketAddr, sync::Arc};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::sync::mpsc;

use crate::{
    driver::{DataMode, ServerEvent, ServerWriter, SocketServer},
    error::Result,
    msg::Message,
};

/// Executor bound to a command byte.
///
/// Receives the payload past the message header and the handle to send a
/// reply or notification through. The returned flag only feeds a log line.
/// Executors run on the server's dispatch task and must not block.
pub type CommandExecutor = Box<dyn Fn(&ServerHandle, &[u8]) -> bool + Send + Sync>;

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// Number of clients allowed to stay connected at once.
    #[serde_inline_default(1)]
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Write handle to the server's connected clients.
///
/// Clonable and cheap; executors capture one to send their replies.
#[derive(Clone)]
pub struct ServerHandle {
    writer: ServerWriter,
}

impl ServerHandle {
    /// Sends a `(RequestResponse, command, payload)` reply.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when no client is connected.
    pub fn respond(&self, command: u8, payload: &[u8]) -> Result<()> {
        self.writer.write(Message::request(command, payload).encode())
    }

    /// Sends a `(Notification, command, payload)` push.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when no client is connected.
    pub fn notify(&self, command: u8, payload: &[u8]) -> Result<()> {
        self.writer
            .write(Message::notification(command, payload).encode())
    }
}

/// Server endpoint routing inbound commands to registered executors.
///
/// A missing executor or a malformed frame is logged and dropped; the
/// server stays available for subsequent commands.
#[derive(Clone)]
pub struct RpcServer {
    socket: Arc<SocketServer>,
    executors: Arc<DashMap<u8, CommandExecutor, RandomState>>,
}

impl RpcServer {
    /// Binds and starts serving.
    ///
    /// Port 0 is supported; the effective address is available through
    /// [`local_addr`](Self::local_addr).
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the address cannot be bound.
    pub async fn start(config: ServerConfig, addr: SocketAddr) -> Result<Self> {
        let (socket, events) =
            SocketServer::start(DataMode::PayloadHeader, addr, config.max_clients).await?;

        let server = Self {
            socket: Arc::new(socket),
            executors: Arc::new(DashMap::default()),
        };

        tokio::spawn(dispatch_events(
            events,
            Arc::clone(&server.executors),
            server.handle(),
        ));

        Ok(server)
    }

    /// Stops accepting and closes all connections. Safe to call repeatedly.
    pub fn stop(&self) {
        self.socket.stop();
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.socket.client_count()
    }

    /// Returns a write handle for replies and spontaneous notifications.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            writer: self.socket.writer(),
        }
    }

    /// Registers or replaces the executor for a command.
    pub fn add_command_executor(
        &self,
        command: u8,
        executor: impl Fn(&ServerHandle, &[u8]) -> bool + Send + Sync + 'static,
    ) {
        self.executors.insert(command, Box::new(executor));
    }

    /// Unregisters an executor. No-op when absent.
    pub fn remove_command_executor(&self, command: u8) {
        self.executors.remove(&command);
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("socket", &self.socket)
            .finish()
    }
}

async fn dispatch_events(
    mut events: mpsc::Receiver<ServerEvent>,
    executors: Arc<DashMap<u8, CommandExecutor, RandomState>>,
    handle: ServerHandle,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::ClientDataRecv(id, payload) => {
                if payload.is_empty() {
                    tracing::error!("empty frame from client {id}");
                    continue;
                }
                match Message::parse(payload) {
                    Ok(msg) => {
                        tracing::debug!("client {id} sent command {}", msg.command);
                        if let Some(executor) = executors.get(&msg.command) {
                            if !(executor.value())(&handle, &msg.payload) {
                                tracing::error!("executor for command {} failed", msg.command);
                            }
                        } else {
                            tracing::error!("no executor for command {}", msg.command);
                        }
                    }
                    Err(e) => tracing::error!("malformed message from client {id}: {e}"),
                }
            }
            ServerEvent::ClientConnected(id) => {
                tracing::info!("client connected, id {id}");
            }
            ServerEvent::ClientDisconnected(id) => {
                tracing::info!("client {id} disconnected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_clients, 1);
    }
}
