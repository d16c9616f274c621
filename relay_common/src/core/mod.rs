//! # Relay Pipeline
//!
//! The two ends of the relay and the buffer in front of the publishing end.
//!
//! - **`relay_queue`**: the bounded FIFO between HTTP ingestion and the
//!   publisher. Its enqueue timeout is the only backpressure in the system.
//! - **`publisher`**: drains the queue onto the transport and emits
//!   heartbeats. Failed sends go to its retry queue.
//! - **`subscriber`**: receives frames, tracks publisher liveness, decodes
//!   data envelopes and forwards them downstream. Failed frames go to its own
//!   retry queue.
//!
//! Delivery is at-least-once end to end; the downstream API is assumed to be
//! idempotent.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Edge-side publishing loop and heartbeat emitter.
pub mod publisher;
/// Bounded ingestion buffer.
pub mod relay_queue;
/// Internal-side receive loop and liveness monitor.
pub mod subscriber;

pub use publisher::{Publisher, PublisherSettings, PublisherState};
pub use relay_queue::{RelayQueue, RelayQueueItem};
pub use subscriber::{DataHandler, Subscriber, SubscriberSettings};
