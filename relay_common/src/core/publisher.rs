//! # Publisher
//!
//! Drains the relay queue onto the transport as `"data"` frames and emits a
//! `"heartbeat"` frame on a fixed period. The payload is forwarded as-is;
//! envelopes are built upstream by the crawlers.
//!
//! A failed send never stops the publish loop: the item goes to the
//! publisher's retry queue, which re-sends the same frame on the backoff
//! schedule.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::relay_queue::{RelayQueue, RelayQueueItem};
use crate::errors::{RelayError, RelayResult};
use crate::lifecycle::{join_with_timeout, StopSignal};
use crate::retry::{DeadLetterFn, RetryPolicy, RetryQueue};
use crate::transport::{Frame, FrameSink, HeartbeatMessage};

/// Lifecycle of a [`Publisher`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// Constructed, threads not started.
    Init,
    /// Publish and heartbeat threads are running.
    Running,
    /// `stop()` is in progress.
    Stopping,
    /// Terminal.
    Stopped,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublisherState::Init => "INIT",
            PublisherState::Running => "RUNNING",
            PublisherState::Stopping => "STOPPING",
            PublisherState::Stopped => "STOPPED",
        })
    }
}

/// Timing and retry parameters for a [`Publisher`].
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Period between heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Wait after a failed heartbeat before trying again.
    pub heartbeat_retry: Duration,
    /// How long one dequeue waits before re-checking the stop flag.
    pub dequeue_timeout: Duration,
    /// Per-thread join timeout used by `stop()`.
    pub join_timeout: Duration,
    /// Policy for re-sending failed data frames.
    pub retry: RetryPolicy,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_retry: Duration::from_secs(30),
            dequeue_timeout: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Edge-side relay endpoint.
pub struct Publisher {
    queue: RelayQueue,
    sink: Arc<dyn FrameSink>,
    settings: PublisherSettings,
    state: Mutex<PublisherState>,
    stop: StopSignal,
    retry: Arc<RetryQueue<RelayQueueItem>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Publisher {
    /// Builds a publisher in the `Init` state. Its retry queue starts
    /// immediately; the publish and heartbeat threads start with [`start`](Self::start).
    pub fn new(
        queue: RelayQueue,
        sink: Arc<dyn FrameSink>,
        settings: PublisherSettings,
        dead_letter: Option<DeadLetterFn<RelayQueueItem>>,
    ) -> RelayResult<Self> {
        let resend_sink = Arc::clone(&sink);
        let retry = RetryQueue::new(
            "publisher",
            settings.retry.clone(),
            Arc::new(move |item: &RelayQueueItem| {
                tracing::info!(received_at = %item.enqueued_at, "Re-publishing data frame");
                resend_sink.send(&Frame::data(item.payload.as_bytes()))
            }),
            dead_letter,
        )?;

        Ok(Self {
            queue,
            sink,
            settings,
            state: Mutex::new(PublisherState::Init),
            stop: StopSignal::new(),
            retry: Arc::new(retry),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Starts the publish loop and the heartbeat thread.
    pub fn start(&self) -> RelayResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PublisherState::Init => *state = PublisherState::Running,
                PublisherState::Running => {
                    tracing::warn!("Publisher already running");
                    return Ok(());
                }
                PublisherState::Stopping | PublisherState::Stopped => return Err(RelayError::Closed),
            }
        }

        let publish = {
            let queue = self.queue.clone();
            let sink = Arc::clone(&self.sink);
            let retry = Arc::clone(&self.retry);
            let stop = self.stop.clone();
            let dequeue_timeout = self.settings.dequeue_timeout;
            thread::Builder::new()
                .name("publisher-loop".to_string())
                .spawn(move || publish_loop(queue, sink, retry, stop, dequeue_timeout))?
        };

        let heartbeat = {
            let queue = self.queue.clone();
            let sink = Arc::clone(&self.sink);
            let stop = self.stop.clone();
            let interval = self.settings.heartbeat_interval;
            let backoff = self.settings.heartbeat_retry;
            thread::Builder::new()
                .name("publisher-heartbeat".to_string())
                .spawn(move || heartbeat_loop(queue, sink, stop, interval, backoff))?
        };

        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([publish, heartbeat]);
        tracing::info!(
            capacity = self.queue.capacity(),
            heartbeat_secs = self.settings.heartbeat_interval.as_secs_f64(),
            "Publisher started"
        );
        Ok(())
    }

    /// Stops both threads, closes the transport and shuts the retry queue
    /// down. Safe to call more than once.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, PublisherState::Stopping | PublisherState::Stopped) {
                return;
            }
            *state = PublisherState::Stopping;
        }

        self.stop.stop();
        self.sink.close();
        let handles: Vec<JoinHandle<()>> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            join_with_timeout(handle, self.settings.join_timeout);
        }
        self.retry.shutdown(self.settings.join_timeout);

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = PublisherState::Stopped;
        tracing::info!(pending = self.queue.len(), "Publisher stopped");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PublisherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Failed frames waiting for a retry.
    pub fn retry_depth(&self) -> usize {
        self.retry.len()
    }

    /// The relay queue this publisher drains.
    pub fn queue(&self) -> &RelayQueue {
        &self.queue
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

fn publish_loop(
    queue: RelayQueue,
    sink: Arc<dyn FrameSink>,
    retry: Arc<RetryQueue<RelayQueueItem>>,
    stop: StopSignal,
    dequeue_timeout: Duration,
) {
    tracing::info!("Publish loop started");
    while !stop.is_stopped() {
        let Some(item) = queue.dequeue(dequeue_timeout) else {
            continue;
        };
        match sink.send(&Frame::data(item.payload.as_bytes())) {
            Ok(()) => {
                tracing::info!(received_at = %item.enqueued_at, bytes = item.payload.len(), "Published data frame");
            }
            Err(e) => {
                tracing::error!(received_at = %item.enqueued_at, "Publishing data frame failed: {}", e);
                if !retry.add_task(item) {
                    tracing::error!("Data frame dropped: retry queue rejected it");
                }
            }
        }
    }
    tracing::info!("Publish loop exited");
}

fn heartbeat_loop(
    queue: RelayQueue,
    sink: Arc<dyn FrameSink>,
    stop: StopSignal,
    interval: Duration,
    backoff: Duration,
) {
    while !stop.is_stopped() {
        let beat = HeartbeatMessage::now(queue.len());
        let wait = match beat.encode().and_then(|payload| sink.send(&Frame::heartbeat(payload))) {
            Ok(()) => {
                tracing::debug!(queue_size = beat.queue_size, "Heartbeat sent");
                interval
            }
            Err(e) => {
                if stop.is_stopped() {
                    break;
                }
                tracing::error!("Heartbeat failed: {}", e);
                backoff
            }
        };
        if stop.wait_timeout(wait) {
            break;
        }
    }
    tracing::debug!("Heartbeat loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use crate::transport::{FrameSource, FrameTag};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_settings() -> PublisherSettings {
        PublisherSettings {
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_retry: Duration::from_millis(20),
            dequeue_timeout: Duration::from_millis(20),
            join_timeout: Duration::from_secs(2),
            retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(10),
                max_backoff: Duration::from_millis(100),
                jitter: false,
                worker_count: 1,
                capacity: 16,
                stats_interval: Duration::from_secs(60),
            },
        }
    }

    /// Sink failing the first `failures` data sends.
    struct FlakySink {
        failures: u32,
        data_calls: AtomicU32,
        inner: memory::MemorySink,
    }

    impl FrameSink for FlakySink {
        fn send(&self, frame: &Frame) -> RelayResult<()> {
            if frame.tag == FrameTag::Data && self.data_calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(RelayError::Transport("link down".into()));
            }
            self.inner.send(frame)
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    fn next_data(source: &memory::MemorySource, deadline: Duration) -> Option<Frame> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if let Ok(Some(frame)) = source.recv(Duration::from_millis(20)) {
                if frame.tag == FrameTag::Data {
                    return Some(frame);
                }
            }
        }
        None
    }

    #[test]
    fn test_lifecycle_and_heartbeat() {
        let (sink, source) = memory::channel(16);
        let queue = RelayQueue::new(8);
        let publisher = Publisher::new(queue.clone(), Arc::new(sink), fast_settings(), None).unwrap();
        assert_eq!(publisher.state(), PublisherState::Init);

        queue.enqueue(RelayQueueItem::new("x"), Duration::ZERO).unwrap();
        publisher.start().unwrap();
        assert_eq!(publisher.state(), PublisherState::Running);

        let first = source.recv(Duration::from_secs(2)).unwrap().unwrap();
        let second = source.recv(Duration::from_secs(2)).unwrap().unwrap();
        let heartbeat = [first, second]
            .into_iter()
            .find(|f| f.tag == FrameTag::Heartbeat)
            .expect("heartbeat frame");
        let beat = HeartbeatMessage::decode(&heartbeat.payload).unwrap();
        assert_eq!(beat.status, "alive");

        publisher.stop();
        assert_eq!(publisher.state(), PublisherState::Stopped);
        assert!(matches!(publisher.start(), Err(RelayError::Closed)));
        publisher.stop();
    }

    #[test]
    fn test_data_frames_follow_dequeue_order() {
        let (sink, source) = memory::channel(16);
        let queue = RelayQueue::new(8);
        let publisher = Publisher::new(queue.clone(), Arc::new(sink), fast_settings(), None).unwrap();
        publisher.start().unwrap();

        for p in ["one", "two", "three"] {
            queue.enqueue(RelayQueueItem::new(p), Duration::ZERO).unwrap();
        }
        for expected in ["one", "two", "three"] {
            let frame = next_data(&source, Duration::from_secs(2)).unwrap();
            assert_eq!(frame.payload, expected.as_bytes());
        }
        publisher.stop();
    }

    #[test]
    fn test_failed_send_is_retried() {
        let (inner, source) = memory::channel(16);
        let sink = Arc::new(FlakySink {
            failures: 2,
            data_calls: AtomicU32::new(0),
            inner,
        });
        let queue = RelayQueue::new(8);
        let publisher = Publisher::new(queue.clone(), sink.clone(), fast_settings(), None).unwrap();
        publisher.start().unwrap();

        queue.enqueue(RelayQueueItem::new("payload"), Duration::ZERO).unwrap();
        let frame = next_data(&source, Duration::from_secs(3)).unwrap();
        assert_eq!(frame.payload, b"payload");
        assert_eq!(sink.data_calls.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.retry_depth(), 0);
        publisher.stop();
    }

    #[test]
    fn test_exhausted_send_is_dead_lettered() {
        let (inner, _source) = memory::channel(16);
        let sink = Arc::new(FlakySink {
            failures: u32::MAX,
            data_calls: AtomicU32::new(0),
            inner,
        });
        let dead: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&dead);
        let mut settings = fast_settings();
        settings.retry.max_retries = 2;

        let queue = RelayQueue::new(8);
        let publisher = Publisher::new(
            queue.clone(),
            sink.clone(),
            settings,
            Some(Arc::new(move |item: RelayQueueItem, _: u32, _: RelayError| {
                record.lock().unwrap().push(item.payload)
            })),
        )
        .unwrap();
        publisher.start().unwrap();
        queue.enqueue(RelayQueueItem::new("doomed"), Duration::ZERO).unwrap();

        let start = Instant::now();
        while dead.lock().unwrap().is_empty() && start.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*dead.lock().unwrap(), vec!["doomed".to_string()]);
        // One direct send plus two from the retry queue.
        assert_eq!(sink.data_calls.load(Ordering::SeqCst), 3);
        publisher.stop();
    }
}
