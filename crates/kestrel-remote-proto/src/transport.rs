use std::io::{self, Read, Write};

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::MAX_FRAME_BYTES;

const LEN_PREFIX_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("stream ended inside a frame ({got} of {expected} bytes)")]
    Truncated { expected: usize, got: usize },
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("failed to allocate frame buffer: {0}")]
    AllocationFailed(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn bincode_options() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_FRAME_BYTES as u64)
}

fn check_len(len: usize) -> Result<u32, ProtocolError> {
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        len,
        max: MAX_FRAME_BYTES,
    })
}

/// Serializes a message into a bare payload (no length prefix).
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode_options()
        .serialize(message)
        .map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    bincode_options()
        .deserialize(payload)
        .map_err(|err| ProtocolError::Decode(err.to_string()))
}

/// Prepends the length prefix to `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = check_len(payload.len())?;
    let mut frame = Vec::with_capacity(LEN_PREFIX_BYTES + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Splits one complete frame into its payload. The slice must hold exactly one frame.
pub fn decode_frame(frame: &[u8]) -> Result<&[u8], ProtocolError> {
    let Some(prefix) = frame.get(..LEN_PREFIX_BYTES) else {
        return Err(ProtocolError::Truncated {
            expected: LEN_PREFIX_BYTES,
            got: frame.len(),
        });
    };
    let mut len_bytes = [0u8; LEN_PREFIX_BYTES];
    len_bytes.copy_from_slice(prefix);
    let len = u32::from_le_bytes(len_bytes) as usize;
    check_len(len)?;

    let payload = &frame[LEN_PREFIX_BYTES..];
    if payload.len() < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            got: payload.len(),
        });
    }
    if payload.len() > len {
        return Err(ProtocolError::TrailingBytes(payload.len() - len));
    }
    Ok(payload)
}

pub fn encode_framed_message<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(&encode_message(message)?)
}

pub fn decode_framed_message<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    decode_message(decode_frame(frame)?)
}

/// Writes one frame and flushes, so the peer never waits on a buffered partial message.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    let frame = encode_framed_message(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` on a clean EOF (no bytes of the next length prefix). EOF anywhere
/// else is [`ProtocolError::Truncated`].
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>, ProtocolError> {
    let mut len_bytes = [0u8; LEN_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LEN_PREFIX_BYTES {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ProtocolError::Truncated {
                    expected: LEN_PREFIX_BYTES,
                    got: filled,
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    // Reject before allocating: a corrupt prefix must not request gigabytes.
    check_len(len)?;

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(len)
        .map_err(|err| ProtocolError::AllocationFailed(format!("{len} bytes: {err}")))?;
    payload.resize(len, 0);

    let mut got = 0;
    while got < len {
        match reader.read(&mut payload[got..]) {
            Ok(0) => return Err(ProtocolError::Truncated { expected: len, got }),
            Ok(n) => got += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    decode_message(&payload).map(Some)
}
