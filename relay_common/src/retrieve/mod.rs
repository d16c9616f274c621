//! # Downstream Retrieval
//!
//! The subscriber hands every decoded payload to a [`Forwarder`]. The stock
//! implementation posts it to the analytics API over blocking HTTP; tests
//! substitute their own.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Analytics API client and route selection.
pub mod forwarder;

pub use forwarder::{route_for, Forwarder, ForwarderSettings, HttpForwarder, Route};
