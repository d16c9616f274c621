//! # Loggers Module
//!
//! Process-wide `tracing` setup shared by the relay binaries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Console plus daily rotating JSON file subscriber.
pub mod setup;

pub use setup::{build_filter, build_subscriber, setup_logging};
