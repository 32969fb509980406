//! Binary frame codec.
//!
//! Every transport message carries exactly one frame:
//!
//! ```text
//! offset 0..4   command id (u32, big-endian)
//! offset 4..N   payload    (raw bytes, N = message length)
//! ```
//!
//! There is no length prefix; the frame length is the message length.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the command id header in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest payload accepted on encode or decode (10 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Errors produced by the frame codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, need at least 4")]
    TooShort { len: usize },

    #[error("payload size {size} exceeds maximum {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Encode a command id and payload into a single frame.
///
/// The payload is copied; the caller's buffer is neither mutated nor retained.
pub fn encode(command_id: u32, payload: &[u8]) -> Result<Bytes, FrameError> {
    check_payload(payload.len())?;

    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    out.put_u32(command_id);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Decode a frame into its command id and a borrowed view of the payload.
///
/// The payload aliases `data`; copy it if it must outlive the input buffer.
pub fn decode(data: &[u8]) -> Result<(u32, &[u8]), FrameError> {
    let command_id = read_header(data)?;
    Ok((command_id, &data[HEADER_SIZE..]))
}

/// Decode a shared receive buffer without copying.
///
/// The returned payload is a slice of `data`'s allocation. `Bytes` is
/// immutable, so handlers can hold on to it past dispatch.
pub fn decode_shared(data: Bytes) -> Result<(u32, Bytes), FrameError> {
    let command_id = read_header(&data)?;
    Ok((command_id, data.slice(HEADER_SIZE..)))
}

fn read_header(data: &[u8]) -> Result<u32, FrameError> {
    if data.len() < HEADER_SIZE {
        return Err(FrameError::TooShort { len: data.len() });
    }
    check_payload(data.len() - HEADER_SIZE)?;

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&data[..HEADER_SIZE]);
    Ok(u32::from_be_bytes(header))
}

fn check_payload(size: usize) -> Result<(), FrameError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}
