//! # relay_common
//!
//! Shared library for the crawler telemetry relay. The edge side ingests
//! telemetry over HTTP and publishes it as framed messages; the internal side
//! receives those frames, opens the encrypted envelope and forwards the
//! result to the analytics API.
//!
//! Modules are gated by cargo features so each binary only pulls the stack it
//! needs. `errors` and `lifecycle` are always present.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod errors;
pub mod lifecycle;

#[cfg(feature = "codec")]
pub mod codec;
#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "pipeline")]
pub mod core;
#[cfg(feature = "ingest")]
pub mod ingestors;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "forward")]
pub mod retrieve;
#[cfg(feature = "retry")]
pub mod retry;
#[cfg(feature = "transport")]
pub mod transport;

pub use errors::{DecodeError, RelayError, RelayResult};
