use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::errors::{RelayError, RelayResult};

/// One ingested payload waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayQueueItem {
    /// Already-encoded payload text. Opaque to the relay.
    pub payload: String,
    /// When the ingestion handler accepted it.
    pub enqueued_at: DateTime<Utc>,
}

impl RelayQueueItem {
    /// Stamps `payload` with the current time.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Bounded FIFO between the HTTP handlers and the publisher loop.
///
/// This is the only backpressure point of the relay: when it is full,
/// `enqueue` waits out its timeout and then reports `QueueFull` to the caller.
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone)]
pub struct RelayQueue {
    tx: Sender<RelayQueueItem>,
    rx: Receiver<RelayQueueItem>,
    capacity: usize,
}

impl RelayQueue {
    /// Default capacity used by the publisher process.
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// Creates a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Adds an item, waiting up to `timeout` for room.
    pub fn enqueue(&self, item: RelayQueueItem, timeout: Duration) -> RelayResult<()> {
        match self.tx.send_timeout(item, timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(capacity = self.capacity, "Relay queue full; rejecting item");
                Err(RelayError::QueueFull { capacity: self.capacity })
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(RelayError::Closed),
        }
    }

    /// Takes the oldest item, or `None` if nothing arrived within `timeout`.
    pub fn dequeue(&self, timeout: Duration) -> Option<RelayQueueItem> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RelayQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = RelayQueue::new(4);
        for p in ["a", "b", "c"] {
            queue.enqueue(RelayQueueItem::new(p), Duration::ZERO).unwrap();
        }
        assert_eq!(queue.len(), 3);
        let drained: Vec<String> = (0..3)
            .filter_map(|_| queue.dequeue(Duration::ZERO))
            .map(|item| item.payload)
            .collect();
        assert_eq!(drained, vec!["a", "b", "c"]);
        assert!(queue.dequeue(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_full_queue_fails_within_timeout() {
        let queue = RelayQueue::new(2);
        queue.enqueue(RelayQueueItem::new("1"), Duration::ZERO).unwrap();
        queue.enqueue(RelayQueueItem::new("2"), Duration::ZERO).unwrap();

        let started = Instant::now();
        let err = queue
            .enqueue(RelayQueueItem::new("3"), Duration::from_millis(50))
            .unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, RelayError::QueueFull { capacity: 2 }));
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_secs(2));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_blocked_enqueue_proceeds_when_room_frees() {
        let queue = RelayQueue::new(1);
        queue.enqueue(RelayQueueItem::new("first"), Duration::ZERO).unwrap();

        let producer = queue.clone();
        let handle = thread::spawn(move || producer.enqueue(RelayQueueItem::new("second"), Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.dequeue(Duration::ZERO).unwrap().payload, "first");
        handle.join().unwrap().unwrap();
        assert_eq!(queue.dequeue(Duration::from_secs(1)).unwrap().payload, "second");
    }

    #[test]
    fn test_concurrent_producers_never_exceed_capacity() {
        let queue = RelayQueue::new(10);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let q = queue.clone();
                thread::spawn(move || {
                    (0..10)
                        .filter(|i| q.enqueue(RelayQueueItem::new(format!("{}-{}", t, i)), Duration::from_millis(5)).is_ok())
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
        assert_eq!(queue.len(), 10);
    }
}
