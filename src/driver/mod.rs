//! Socket drivers delivering framed payloads over TCP.
//!
//! The drivers speak two framing modes. In [`DataMode::PayloadHeader`] every
//! frame is prefixed with a 4-byte big-endian length which is stripped before
//! delivery. In [`DataMode::NewLineDelimiter`] the stream is cut at `\n`
//! bytes and the delimiter stays part of the delivered payload.
//!
//! Received frames and connection state changes are delivered as events
//! through an `mpsc` channel returned at connect/start time.

pub mod frame;

mod client;
pub use client::{ClientEvent, SocketClient};

mod server;
pub use server::{ClientId, ServerEvent, ServerWriter, SocketServer};

/// Maximum payload length of a single frame in `PayloadHeader` mode.
pub const MAX_PAYLOAD_LEN: usize = 4096;

/// Size of the length prefix in `PayloadHeader` mode.
pub const LENGTH_HEADER_SIZE: usize = std::mem::size_of::<u32>();

/// Frame delimiter in `NewLineDelimiter` mode.
pub const FRAME_DELIMITER: u8 = b'\n';

pub(crate) const SEND_QUEUE_CAPACITY: usize = 64;
pub(crate) const EVENT_QUEUE_CAPACITY: usize = 64;
pub(crate) const RECV_BUFFER_CAPACITY: usize = 2 * MAX_PAYLOAD_LEN;

/// Framing mode of a socket connection. Both peers must use the same mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataMode {
    /// Frames carry a length prefix, stripped before delivery.
    PayloadHeader,
    /// Frames end at a newline byte, included in the delivery.
    NewLineDelimiter,
}
