//! # Subscriber
//!
//! Internal-side relay endpoint. One thread receives frames and dispatches
//! them by tag; a second thread watches heartbeat recency and re-issues
//! `connect` on the transport when the publisher has gone quiet.
//!
//! The data path is `payload -> UTF-8 -> decrypt -> JSON -> forward`. Any
//! failure along it sends the raw frame payload to the subscriber's retry
//! queue, which re-runs the whole chain later.
//!
//! The liveness reconnect is conservative: it only re-issues `connect` on the
//! existing handle. A socket that is dead at the OS level but still held is not
//! torn down by it.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::codec::EnvelopeCodec;
use crate::errors::{DecodeError, RelayError, RelayResult};
use crate::lifecycle::{join_with_timeout, StopSignal};
use crate::retrieve::Forwarder;
use crate::retry::{attempt_with_retry, DeadLetterFn, RetryPolicy, RetryQueue};
use crate::transport::{Frame, FrameSource, FrameTag, HeartbeatMessage};

/// Timing and retry parameters for a [`Subscriber`].
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    /// Bound on a single receive, so the loop can observe shutdown.
    pub recv_timeout: Duration,
    /// Silence after which the publisher is considered gone.
    pub heartbeat_timeout: Duration,
    /// Period of the liveness check.
    pub liveness_check: Duration,
    /// Pause after a receive error.
    pub receive_error_backoff: Duration,
    /// Attempts for the initial connect.
    pub connect_attempts: u32,
    /// Base backoff between initial connect attempts.
    pub connect_base_delay: Duration,
    /// Per-thread join timeout used by `stop()`.
    pub join_timeout: Duration,
    /// Policy for re-running failed data frames.
    pub retry: RetryPolicy,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(900),
            liveness_check: Duration::from_secs(10),
            receive_error_backoff: Duration::from_secs(10),
            connect_attempts: 5,
            connect_base_delay: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Decodes a data frame payload and forwards the result.
pub struct DataHandler {
    codec: EnvelopeCodec,
    forwarder: Arc<dyn Forwarder>,
}

impl DataHandler {
    /// Pairs the envelope codec with the downstream forwarder.
    pub fn new(codec: EnvelopeCodec, forwarder: Arc<dyn Forwarder>) -> Self {
        Self { codec, forwarder }
    }

    /// Runs the full data chain on a raw frame payload.
    pub fn handle(&self, raw: &[u8]) -> RelayResult<()> {
        let started = Instant::now();
        let text = std::str::from_utf8(raw).map_err(|_| DecodeError)?;
        let plain = self.codec.decrypt(text)?;
        let value: Value = serde_json::from_str(&plain).map_err(|e| {
            tracing::debug!("Decrypted payload is not JSON: {}", e);
            DecodeError
        })?;
        log_metadata(&value, started.elapsed());
        self.forwarder.forward(&value)
    }
}

fn log_metadata(value: &Value, decode_time: Duration) {
    let inner = value.get("payload");
    let field = |name: &str| {
        inner
            .and_then(|p| p.get(name))
            .map(|v| v.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    };
    let data_size = inner
        .and_then(|p| p.get("data"))
        .map(|d| match d {
            Value::String(s) => s.len(),
            other => other.to_string().len(),
        })
        .unwrap_or(0);
    tracing::info!(
        sequence = %field("sequence"),
        timestamp = %field("timestamp"),
        data_size,
        decode_ms = decode_time.as_secs_f64() * 1000.0,
        "Data frame received"
    );
}

/// Internal-side relay endpoint.
pub struct Subscriber {
    source: Arc<dyn FrameSource>,
    handler: Arc<DataHandler>,
    settings: SubscriberSettings,
    last_heartbeat: Arc<Mutex<Instant>>,
    stop: StopSignal,
    retry: Arc<RetryQueue<Vec<u8>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscriber {
    /// Builds the subscriber and starts its retry queue.
    pub fn new(
        source: Arc<dyn FrameSource>,
        handler: DataHandler,
        settings: SubscriberSettings,
        dead_letter: Option<DeadLetterFn<Vec<u8>>>,
    ) -> RelayResult<Self> {
        let handler = Arc::new(handler);
        let retry_handler = Arc::clone(&handler);
        let retry = RetryQueue::new(
            "subscriber",
            settings.retry.clone(),
            Arc::new(move |raw: &Vec<u8>| retry_handler.handle(raw)),
            dead_letter,
        )?;

        Ok(Self {
            source,
            handler,
            settings,
            last_heartbeat: Arc::new(Mutex::new(Instant::now())),
            stop: StopSignal::new(),
            retry: Arc::new(retry),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Connects (retrying inline with backoff) and starts the receive loop and
    /// the liveness monitor.
    pub fn start(&self) -> RelayResult<()> {
        if self.stop.is_stopped() {
            return Err(RelayError::Closed);
        }
        attempt_with_retry(
            || self.source.connect(),
            self.settings.connect_attempts,
            self.settings.connect_base_delay,
        )?;
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();

        let receiver = {
            let ctx = ReceiveContext {
                source: Arc::clone(&self.source),
                handler: Arc::clone(&self.handler),
                retry: Arc::clone(&self.retry),
                last_heartbeat: Arc::clone(&self.last_heartbeat),
                stop: self.stop.clone(),
                recv_timeout: self.settings.recv_timeout,
                error_backoff: self.settings.receive_error_backoff,
            };
            thread::Builder::new()
                .name("subscriber-recv".to_string())
                .spawn(move || ctx.run())?
        };

        let monitor = {
            let source = Arc::clone(&self.source);
            let last_heartbeat = Arc::clone(&self.last_heartbeat);
            let stop = self.stop.clone();
            let timeout = self.settings.heartbeat_timeout;
            let period = self.settings.liveness_check;
            thread::Builder::new()
                .name("subscriber-liveness".to_string())
                .spawn(move || liveness_loop(source, last_heartbeat, stop, timeout, period))?
        };

        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([receiver, monitor]);
        tracing::info!(
            heartbeat_timeout_secs = self.settings.heartbeat_timeout.as_secs(),
            "Subscriber started; waiting for frames"
        );
        Ok(())
    }

    /// Stops both threads, closes the transport and the retry queue.
    pub fn stop(&self) {
        if self.stop.is_stopped() {
            return;
        }
        self.stop.stop();
        self.source.close();
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
        tracing::info!("Subscriber stopped");
    }

    /// Time since the last valid heartbeat (or since start).
    pub fn last_heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Whether a heartbeat was seen within the configured timeout.
    pub fn is_live(&self) -> bool {
        self.last_heartbeat_age() <= self.settings.heartbeat_timeout
    }

    /// Failed data frames waiting for a retry.
    pub fn retry_depth(&self) -> usize {
        self.retry.len()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

struct ReceiveContext {
    source: Arc<dyn FrameSource>,
    handler: Arc<DataHandler>,
    retry: Arc<RetryQueue<Vec<u8>>>,
    last_heartbeat: Arc<Mutex<Instant>>,
    stop: StopSignal,
    recv_timeout: Duration,
    error_backoff: Duration,
}

impl ReceiveContext {
    fn run(self) {
        while !self.stop.is_stopped() {
            match self.source.recv(self.recv_timeout) {
                Ok(Some(frame)) => self.dispatch(frame),
                Ok(None) => continue,
                Err(RelayError::Closed) => break,
                Err(e) => {
                    if self.stop.is_stopped() {
                        break;
                    }
                    tracing::error!("Receive failed: {}", e);
                    self.stop.wait_timeout(self.error_backoff);
                }
            }
        }
        tracing::info!("Receive loop exited");
    }

    fn dispatch(&self, frame: Frame) {
        match frame.tag {
            FrameTag::Heartbeat => match HeartbeatMessage::decode(&frame.payload) {
                Ok(beat) => {
                    *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                    tracing::info!(timestamp = beat.timestamp, queue_size = beat.queue_size, "Heartbeat received");
                }
                Err(e) => tracing::warn!("Ignoring malformed heartbeat: {}", e),
            },
            FrameTag::Data => {
                if let Err(e) = self.handler.handle(&frame.payload) {
                    tracing::error!("Data frame failed ({}); queued for retry", e);
                    if !self.retry.add_task(frame.payload) {
                        tracing::error!("Data frame dropped: retry queue rejected it");
                    }
                }
            }
            FrameTag::Unknown(tag) => {
                tracing::info!(tag = %tag, "Dropping frame with unknown tag");
            }
        }
    }
}

fn liveness_loop(
    source: Arc<dyn FrameSource>,
    last_heartbeat: Arc<Mutex<Instant>>,
    stop: StopSignal,
    timeout: Duration,
    period: Duration,
) {
    while !stop.wait_timeout(period) {
        let age = last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner).elapsed();
        if age > timeout {
            tracing::warn!(
                silent_secs = age.as_secs_f64(),
                "Heartbeat timeout; re-issuing connect"
            );
            if let Err(e) = source.connect() {
                tracing::error!("Reconnect failed: {}", e);
            }
        }
    }
}
