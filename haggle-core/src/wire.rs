//! Framing: length-prefix (4 bytes LE) + bincode payload.

use std::io::{Read, Write};

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(msg).map_err(FrameError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameError::NeedMore);
    }
    let msg = decode_payload(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Payload length from a length prefix, checked against the frame limit.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode a frame body (without the length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<Message, FrameError> {
    bincode::deserialize(payload).map_err(FrameError::Decode)
}

/// Blocking write of one frame.
pub fn write_frame<W: Write>(w: &mut W, msg: &Message) -> Result<(), FrameError> {
    let frame = encode_frame(msg)?;
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Blocking read of one frame. A clean close before the length prefix is `Closed`.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Message, FrameError> {
    let mut prefix = [0u8; LEN_SIZE];
    if let Err(e) = r.read_exact(&mut prefix) {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(e),
        });
    }
    let len = frame_len(prefix)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    decode_payload(&payload)
}

/// Error encoding, decoding or transferring a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("connection closed")]
    Closed,
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
