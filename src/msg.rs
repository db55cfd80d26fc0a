use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Payload,
    error::{Error, ErrorKind, Result},
};

/// Fixed size of the message header prepended to every payload.
pub const MSG_HEADER_SIZE: usize = 2;

const MSG_TYPE_OFFSET: usize = 0;
const COMMAND_OFFSET: usize = 1;

/// Message type carried in the first header byte.
///
/// - `Notification`: one-way push, no reply is expected.
/// - `RequestResponse`: expects exactly one matching reply before the next
///   request may be issued on the same client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Notification = 0,
    RequestResponse = 1,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MsgType::Notification),
            1 => Ok(MsgType::RequestResponse),
            other => Err(Error::new(
                ErrorKind::MalformedMessage,
                format!("unknown message type: {other}"),
            )),
        }
    }
}

/// RPC message exchanged inside one socket-level frame.
///
/// Wire layout:
///
/// ```text
/// | 1 byte | 1 byte  | N bytes |
/// | type   | command | payload |
/// ```
///
/// The length of the frame itself is the socket driver's concern, not part
/// of this header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MsgType,
    pub command: u8,
    pub payload: Payload,
}

impl Message {
    pub fn new(msg_type: MsgType, command: u8, payload: impl Into<Payload>) -> Self {
        Self {
            msg_type,
            command,
            payload: payload.into(),
        }
    }

    /// Shorthand for a `RequestResponse` message.
    pub fn request(command: u8, payload: impl Into<Payload>) -> Self {
        Self::new(MsgType::RequestResponse, command, payload)
    }

    /// Shorthand for a `Notification` message.
    pub fn notification(command: u8, payload: impl Into<Payload>) -> Self {
        Self::new(MsgType::Notification, command, payload)
    }

    /// Serializes the message as `[type][command]payload`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(MSG_HEADER_SIZE + self.payload.len());
        bytes.put_u8(self.msg_type as u8);
        bytes.put_u8(self.command);
        bytes.extend_from_slice(&self.payload);
        bytes.freeze()
    }

    /// Parses a message out of one received frame.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` if the frame is shorter than the 2-byte
    /// header or carries an unknown type byte. The input is never indexed
    /// past its length.
    pub fn parse(frame: impl Into<Payload>) -> Result<Self> {
        let mut payload: Payload = frame.into();
        if payload.len() < MSG_HEADER_SIZE {
            return Err(Error::new(
                ErrorKind::MalformedMessage,
                format!("frame too short: {} bytes", payload.len()),
            ));
        }

        let msg_type = MsgType::try_from(payload[MSG_TYPE_OFFSET])?;
        let command = payload[COMMAND_OFFSET];
        payload.advance(MSG_HEADER_SIZE);

        Ok(Self {
            msg_type,
            command,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let msg = Message::request(5, vec![0x01, 0x02]);
        let parsed = Message::parse(msg.encode()).unwrap();
        assert_eq!(parsed.msg_type, MsgType::RequestResponse);
        assert_eq!(parsed.command, 5);
        assert_eq!(parsed.payload.as_slice(), &[0x01, 0x02]);

        let msg = Message::notification(255, Payload::Empty);
        let parsed = Message::parse(msg.encode()).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Notification);
        assert_eq!(parsed.command, 255);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_parse_undersized_frame() {
        let err = Message::parse(Payload::Empty).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedMessage);

        let err = Message::parse(vec![0x01]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedMessage);
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = Message::parse(vec![0x07, 0x01]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MalformedMessage);
    }

    #[test]
    fn test_header_only_frame() {
        let parsed = Message::parse(vec![0x00, 0x09]).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Notification);
        assert_eq!(parsed.command, 9);
        assert!(parsed.payload.is_empty());
    }
}
