use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DataMode, FRAME_DELIMITER, LENGTH_HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::error::{Error, ErrorKind, Result};

/// Wraps an outbound payload into one frame for the given mode.
///
/// # Errors
///
/// Returns `FrameTooLong` if the payload exceeds [`MAX_PAYLOAD_LEN`] in
/// header mode. Delimiter mode passes the bytes through unchanged; the
/// caller is responsible for terminating them with a newline.
pub fn encode_frame(mode: DataMode, payload: &[u8]) -> Result<Bytes> {
    match mode {
        DataMode::PayloadHeader => {
            if payload.len() > MAX_PAYLOAD_LEN {
                return Err(Error::new(
                    ErrorKind::FrameTooLong,
                    format!("payload is too long: {}", payload.len()),
                ));
            }
            let mut bytes = BytesMut::with_capacity(LENGTH_HEADER_SIZE + payload.len());
            bytes.put_u32(u32::try_from(payload.len())?);
            bytes.extend_from_slice(payload);
            Ok(bytes.freeze())
        }
        DataMode::NewLineDelimiter => Ok(Bytes::copy_from_slice(payload)),
    }
}

/// Extracts the next complete frame from an accumulation buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
/// caller should read more bytes and retry.
///
/// # Errors
///
/// Returns `FrameTooLong` if a length prefix announces a payload larger
/// than [`MAX_PAYLOAD_LEN`]. The connection is not recoverable past this
/// point since the stream position is undefined.
pub fn extract_frame(mode: DataMode, buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    match mode {
        DataMode::PayloadHeader => {
            if buffer.len() < LENGTH_HEADER_SIZE {
                return Ok(None);
            }
            let len =
                u32::from_be_bytes(buffer[..LENGTH_HEADER_SIZE].try_into().unwrap()) as usize;
            if len > MAX_PAYLOAD_LEN {
                return Err(Error::new(
                    ErrorKind::FrameTooLong,
                    format!("announced payload is too long: {len}"),
                ));
            }
            if buffer.len() < LENGTH_HEADER_SIZE + len {
                return Ok(None);
            }
            buffer.advance(LENGTH_HEADER_SIZE);
            Ok(Some(buffer.split_to(len).freeze()))
        }
        DataMode::NewLineDelimiter => {
            match buffer.iter().position(|&b| b == FRAME_DELIMITER) {
                // the delimiter stays in the frame
                Some(pos) => Ok(Some(buffer.split_to(pos + 1).freeze())),
                None => Ok(None),
            }
        }
    }
}
