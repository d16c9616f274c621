//! # Transport Module
//!
//! The publisher and subscriber exchange two-part frames: an ASCII tag
//! (`"heartbeat"` or `"data"`) and an opaque payload. This module defines the
//! frame type, the traits both sides program against, and the concrete
//! transports.
//!
//! - **`wire`**: length-prefixed binary framing for stream sockets.
//! - **`tcp`**: a fan-out TCP publisher socket and a reconnectable TCP
//!   subscriber socket.
//! - **`memory`**: an in-process transport pair over a bounded channel.
//! - **`heartbeat`**: the compressed JSON heartbeat payload.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::time::Duration;

use crate::errors::RelayResult;

/// Compressed JSON heartbeat payloads.
pub mod heartbeat;
/// In-process transport used by tests and local wiring.
pub mod memory;
/// TCP publisher and subscriber sockets.
pub mod tcp;
/// Length-prefixed frame encoding.
pub mod wire;

pub use heartbeat::HeartbeatMessage;
pub use tcp::{TcpFrameSink, TcpFrameSource};

/// The first part of every frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FrameTag {
    /// Publisher liveness beacon.
    Heartbeat,
    /// An encrypted telemetry envelope.
    Data,
    /// Anything else seen on the wire. Logged and dropped by the subscriber.
    Unknown(String),
}

impl FrameTag {
    /// The ASCII tag as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            FrameTag::Heartbeat => "heartbeat",
            FrameTag::Data => "data",
            FrameTag::Unknown(tag) => tag,
        }
    }

    /// Classifies a raw tag.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "heartbeat" => FrameTag::Heartbeat,
            "data" => FrameTag::Data,
            other => FrameTag::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged unit sent over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Part one: what kind of frame this is.
    pub tag: FrameTag,
    /// Part two: opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// A `"data"` frame carrying an already-encoded envelope.
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: FrameTag::Data,
            payload: payload.into(),
        }
    }

    /// A `"heartbeat"` frame with an encoded [`HeartbeatMessage`].
    pub fn heartbeat(payload: Vec<u8>) -> Self {
        Self {
            tag: FrameTag::Heartbeat,
            payload,
        }
    }
}

/// Publishing half of a transport.
///
/// `send` must deliver a frame whole or fail; a partially written frame is a
/// transport error, never a silently truncated message.
pub trait FrameSink: Send + Sync {
    /// Sends one frame.
    fn send(&self, frame: &Frame) -> RelayResult<()>;

    /// Closes the handle. Pending and later sends fail with `Closed`.
    fn close(&self);
}

/// Subscribing half of a transport.
pub trait FrameSource: Send + Sync {
    /// Waits up to `timeout` for the next frame. `Ok(None)` means the timeout
    /// elapsed with nothing to read.
    fn recv(&self, timeout: Duration) -> RelayResult<Option<Frame>>;

    /// Establishes (or re-issues) the connection to the publisher.
    fn connect(&self) -> RelayResult<()>;

    /// Closes the handle, unblocking a pending `recv`.
    fn close(&self);
}

/// Strips an optional `tcp://` scheme from a transport address.
pub fn normalize_address(address: &str) -> &str {
    address.trim().strip_prefix("tcp://").unwrap_or(address.trim())
}
