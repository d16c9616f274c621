use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::{DecodeError, RelayError, RelayResult};

/// Decompressed heartbeats larger than this are rejected.
const MAX_HEARTBEAT_LEN: u64 = 64 * 1024;

/// Liveness beacon sent by the publisher on a fixed period.
///
/// On the wire this is zlib-compressed JSON:
/// `{"type":"heartbeat","timestamp":..,"status":"alive","queue_size":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Always `"heartbeat"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds with sub-second precision, publisher clock.
    pub timestamp: f64,
    /// Always `"alive"` for beacons sent by a running publisher.
    pub status: String,
    /// Relay queue depth when the beacon was built.
    pub queue_size: usize,
}

impl HeartbeatMessage {
    /// A beacon stamped with the current time.
    pub fn now(queue_size: usize) -> Self {
        let now = chrono::Utc::now();
        Self {
            kind: "heartbeat".to_string(),
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
            status: "alive".to_string(),
            queue_size,
        }
    }

    /// Serializes and compresses the beacon into a frame payload.
    pub fn encode(&self) -> RelayResult<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(|e| RelayError::Encode(e.to_string()))?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Decompresses and parses a heartbeat payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut json = Vec::new();
        ZlibDecoder::new(payload)
            .take(MAX_HEARTBEAT_LEN)
            .read_to_end(&mut json)
            .map_err(|e| {
                tracing::debug!("Heartbeat decompression failed: {}", e);
                DecodeError
            })?;
        serde_json::from_slice(&json).map_err(|e| {
            tracing::debug!("Heartbeat JSON invalid: {}", e);
            DecodeError
        })
    }
}
