use std::{net::SocketAddr, sync::Arc, time::Duration};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::{
    Payload,
    driver::{ClientEvent, DataMode, SocketClient},
    error::{Error, ErrorKind, Result},
    msg::{Message, MsgType},
};

/// Handler invoked for a server push, keyed by command byte.
///
/// Receives the payload past the message header. The returned flag only
/// feeds a log line; a `false` does not fail the connection. Handlers run
/// on the connection's dispatch task and must not block.
pub type NotificationHandler = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Upper bound for one request/response transaction.
    #[serde_inline_default(Duration::from_millis(1500))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Client endpoint multiplexing blocking request/response calls and server
/// push notifications over one framed connection.
///
/// At most one request/response transaction may be in flight per instance.
/// The pending transaction occupies a single reply slot; the receive path
/// deposits a matching reply there and anything arriving while the slot is
/// unoccupied is logged and dropped. Notifications bypass the slot entirely
/// and go to their registered handler.
#[derive(Clone)]
pub struct RpcClient {
    config: ClientConfig,
    socket: Arc<SocketClient>,
    handlers: Arc<DashMap<u8, NotificationHandler, RandomState>>,
    pending: Arc<Mutex<Option<oneshot::Sender<Payload>>>>,
}

impl RpcClient {
    /// Connects to an RPC server.
    ///
    /// # Errors
    ///
    /// Returns `ConnectFailed` if the transport cannot establish the
    /// connection.
    pub async fn connect(config: ClientConfig, addr: SocketAddr) -> Result<Self> {
        let (socket, events) = SocketClient::connect(DataMode::PayloadHeader, addr).await?;

        let client = Self {
            config,
            socket: Arc::new(socket),
            handlers: Arc::new(DashMap::default()),
            pending: Arc::new(Mutex::new(None)),
        };

        tokio::spawn(dispatch_events(
            events,
            Arc::clone(&client.handlers),
            Arc::clone(&client.pending),
        ));

        Ok(client)
    }

    /// Closes the connection and fails any pending transaction. Safe to
    /// call when already disconnected.
    pub async fn disconnect(&self) {
        self.socket.disconnect();
        self.pending.lock().await.take();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Registers or replaces the handler for a notification command.
    pub fn add_notification_handler(
        &self,
        command: u8,
        handler: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
    ) {
        self.handlers.insert(command, Box::new(handler));
    }

    /// Unregisters a notification handler. No-op when absent.
    pub fn remove_notification_handler(&self, command: u8) {
        self.handlers.remove(&command);
    }

    /// Performs one request/response transaction.
    ///
    /// Sends `(RequestResponse, command, payload)` and waits for the
    /// matching reply, up to the configured timeout. Only one transaction
    /// may be in flight per instance; an overlapping call is rejected, not
    /// queued.
    ///
    /// # Errors
    ///
    /// - `NotConnected`: no connection, nothing was sent.
    /// - `TransactionPending`: another call is still in flight.
    /// - `Timeout`: no reply arrived in time; the instance stays usable.
    /// - `ConnectionClosed`: the server disconnected while waiting.
    pub async fn invoke(&self, command: u8, payload: impl Into<Payload>) -> Result<Payload> {
        if !self.socket.is_connected() {
            return Err(Error::kind(ErrorKind::NotConnected));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock().await;
            if slot.is_some() {
                return Err(Error::new(
                    ErrorKind::TransactionPending,
                    format!("transaction ongoing, rejecting command {command}"),
                ));
            }
            *slot = Some(reply_tx);
        }

        let msg = Message::request(command, payload);
        if let Err(e) = self.socket.write(msg.encode()) {
            self.pending.lock().await.take();
            return Err(e);
        }

        match tokio::time::timeout(self.config.timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::new(
                ErrorKind::ConnectionClosed,
                format!("server disconnected while waiting for command {command}"),
            )),
            Err(_) => {
                // a reply racing past this point finds the slot empty and is dropped
                self.pending.lock().await.take();
                tracing::error!("response timeout for command {command}");
                Err(Error::kind(ErrorKind::Timeout))
            }
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .field("socket", &self.socket)
            .finish()
    }
}

async fn dispatch_events(
    mut events: mpsc::Receiver<ClientEvent>,
    handlers: Arc<DashMap<u8, NotificationHandler, RandomState>>,
    pending: Arc<Mutex<Option<oneshot::Sender<Payload>>>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::ServerDataRecv(payload) => match Message::parse(payload) {
                Ok(msg) => dispatch_message(msg, &handlers, &pending).await,
                Err(e) => tracing::error!("malformed message from server: {e}"),
            },
            ClientEvent::ServerDisconnected => {
                tracing::info!("server disconnected");
                // wakes a pending invoke with ConnectionClosed
                pending.lock().await.take();
            }
        }
    }
    pending.lock().await.take();
}

async fn dispatch_message(
    msg: Message,
    handlers: &DashMap<u8, NotificationHandler, RandomState>,
    pending: &Mutex<Option<oneshot::Sender<Payload>>>,
) {
    match msg.msg_type {
        MsgType::RequestResponse => {
            if let Some(reply_tx) = pending.lock().await.take() {
                let _ = reply_tx.send(msg.payload);
            } else {
                tracing::error!(
                    "response for command {} received with no transaction pending",
                    msg.command
                );
            }
        }
        MsgType::Notification => {
            if let Some(handler) = handlers.get(&msg.command) {
                if !(handler.value())(&msg.payload) {
                    tracing::error!("notification handler for command {} failed", msg.command);
                }
            } else {
                tracing::error!("no notification handler for command {}", msg.command);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_config_from_json() {
        let config: ClientConfig = serde_json::from_str(r#"{"timeout": "250ms"}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
    }
}
