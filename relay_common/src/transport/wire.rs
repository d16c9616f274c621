//! Frame layout on stream sockets:
//!
//! ```text
//! +----------------+-------------+-----------+---------------+
//! | body len (u32) | tag len (u8)| tag bytes | payload bytes |
//! +----------------+-------------+-----------+---------------+
//! ```
//!
//! The length is big-endian and counts everything after itself.

use crate::errors::{RelayError, RelayResult};
use crate::transport::{Frame, FrameTag};

/// Largest body accepted in either direction.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Serializes `frame` into one contiguous buffer.
pub fn encode_frame(frame: &Frame) -> RelayResult<Vec<u8>> {
    let tag = frame.tag.as_str().as_bytes();
    if tag.len() > u8::MAX as usize {
        return Err(RelayError::Transport(format!("frame tag too long ({} bytes)", tag.len())));
    }
    let body_len = 1 + tag.len() + frame.payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(RelayError::Transport(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body_len, MAX_FRAME_LEN
        )));
    }

    let mut buf = Vec::with_capacity(LEN_PREFIX + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(tag.len() as u8);
    buf.extend_from_slice(tag);
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Takes one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched while the frame is still
/// incomplete. A malformed header is an error; the connection cannot be
/// resynchronized after that.
pub fn decode_frame(buf: &mut Vec<u8>) -> RelayResult<Option<Frame>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if body_len == 0 || body_len > MAX_FRAME_LEN {
        return Err(RelayError::Transport(format!("invalid frame length {}", body_len)));
    }
    if buf.len() < LEN_PREFIX + body_len {
        return Ok(None);
    }

    let body: Vec<u8> = buf.drain(..LEN_PREFIX + body_len).skip(LEN_PREFIX).collect();
    let tag_len = body[0] as usize;
    if 1 + tag_len > body.len() {
        return Err(RelayError::Transport(format!(
            "tag length {} overruns frame body of {} bytes",
            tag_len,
            body.len()
        )));
    }
    let tag = String::from_utf8_lossy(&body[1..1 + tag_len]);

    Ok(Some(Frame {
        tag: FrameTag::parse(&tag),
        payload: body[1 + tag_len..].to_vec(),
    }))
}
