//! Bus message envelope
//!
//! Events travel as JSON payloads; the bus adds a monotonic offset and a
//! receive timestamp on delivery. The offset is the consumer's resume
//! position, persisted after each successful apply or enqueue.

use chrono::{DateTime, Utc};

use courier_core::Event;

use crate::error::{BusError, BusResult};

/// An event as delivered by the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Monotonic position on the bus.
    pub offset: i64,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl BusMessage {
    /// Decode a received payload.
    pub fn from_payload(offset: i64, timestamp: DateTime<Utc>, payload: &[u8]) -> BusResult<Self> {
        let event: Event =
            serde_json::from_slice(payload).map_err(|e| BusError::InvalidPayload {
                offset,
                reason: e.to_string(),
            })?;
        Ok(BusMessage {
            offset,
            timestamp,
            event,
        })
    }
}

/// Encode an event for publication.
pub fn encode_event(event: &Event) -> BusResult<Vec<u8>> {
    serde_json::to_vec(event).map_err(|e| BusError::SerializationFailed {
        cause: e.to_string(),
    })
}
