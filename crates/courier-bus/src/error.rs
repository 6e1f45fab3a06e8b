//! Bus error types

use thiserror::Error;

/// Error raised by a bus producer or consumer.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not reach the broker.
    #[error("bus connection failed to {broker}: {cause}")]
    ConnectionFailed { broker: String, cause: String },

    /// An event could not be published (no acknowledgement).
    #[error("publish failed on {topic}: {cause}")]
    PublishFailed { topic: String, cause: String },

    /// Polling the bus failed.
    #[error("consume failed: {cause}")]
    ConsumeFailed { cause: String },

    /// Seeking to an offset failed.
    #[error("seek failed: {cause}")]
    SeekFailed { cause: String },

    /// An event could not be encoded for the wire.
    #[error("event serialization failed: {cause}")]
    SerializationFailed { cause: String },

    /// A received payload is not a valid event.
    #[error("invalid event payload at offset {offset}: {reason}")]
    InvalidPayload { offset: i64, reason: String },
}

impl BusError {
    /// Transient errors are retried with a fixed backoff; the cycle does
    /// not advance any persisted state meanwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::ConnectionFailed { .. }
                | BusError::PublishFailed { .. }
                | BusError::ConsumeFailed { .. }
                | BusError::SeekFailed { .. }
        )
    }
}

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BusError::ConnectionFailed {
            broker: "k1:9092".to_string(),
            cause: "refused".to_string()
        }
        .is_transient());
        assert!(!BusError::InvalidPayload {
            offset: 3,
            reason: "not json".to_string()
        }
        .is_transient());
    }
}
