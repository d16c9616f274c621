//! # Ingestors Module
//!
//! Entry points that feed the relay queue. The only ingestor is the HTTP API
//! the crawlers post to.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// axum endpoints in front of the relay queue.
pub mod http_ingest;

pub use http_ingest::{router, serve, IngestState};
