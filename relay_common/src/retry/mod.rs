//! # Retry Module
//!
//! Failed sends (publisher side) and failed decode/forward chains (subscriber
//! side) are not dropped. They are handed to a [`RetryQueue`], which re-runs
//! them on an exponential backoff schedule and dead-letters them once the
//! retry budget is spent.
//!
//! - **`policy`**: the backoff schedule and the inline
//!   [`attempt_with_retry`] helper for call sites that must block until an
//!   operation succeeds or gives up.
//! - **`queue`**: the time-ordered retry queue and its worker threads.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Backoff schedule and synchronous retry helper.
pub mod policy;
/// Heap-scheduled retry queue with dead-lettering.
pub mod queue;

pub use policy::{attempt_with_retry, RetryPolicy};
pub use queue::{log_dead_letter, DeadLetterFn, ProcessFn, RetryQueue, RetryTask};
