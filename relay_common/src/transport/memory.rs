//! In-process transport: a bounded `crossbeam` channel carrying whole frames.
//!
//! Frames are delivered atomically by construction. The source counts
//! `connect()` calls so liveness handling can be observed from tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::errors::{RelayError, RelayResult};
use crate::transport::{Frame, FrameSink, FrameSource};

/// Creates a connected sink/source pair holding at most `capacity` frames.
pub fn channel(capacity: usize) -> (MemorySink, MemorySource) {
    let (tx, rx) = bounded(capacity);
    (
        MemorySink {
            tx,
            closed: AtomicBool::new(false),
        },
        MemorySource {
            rx,
            closed: AtomicBool::new(false),
            connects: Arc::new(AtomicUsize::new(0)),
        },
    )
}

/// Publishing end of an in-memory transport.
#[derive(Debug)]
pub struct MemorySink {
    tx: Sender<Frame>,
    closed: AtomicBool,
}

impl FrameSink for MemorySink {
    fn send(&self, frame: &Frame) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        match self.tx.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RelayError::Transport("memory transport is full".to_string())),
            Err(TrySendError::Disconnected(_)) => {
                Err(RelayError::Transport("memory transport has no subscriber".to_string()))
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Subscribing end of an in-memory transport.
#[derive(Debug)]
pub struct MemorySource {
    rx: Receiver<Frame>,
    closed: AtomicBool,
    connects: Arc<AtomicUsize>,
}

impl MemorySource {
    /// Number of `connect()` calls so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Shared handle to the connect counter, for observers that do not own
    /// the source.
    pub fn connect_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }
}

impl FrameSource for MemorySource {
    fn recv(&self, timeout: Duration) -> RelayResult<Option<Frame>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(RelayError::Transport("memory transport publisher is gone".to_string()))
            }
        }
    }

    fn connect(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
