//! # courier-bus
//!
//! Message bus abstraction for the Courier CDC pipeline.
//!
//! The bus is an at-least-once FIFO per consumer group: producers publish
//! acknowledged events and learn their offset, consumers seek by offset and
//! poll in publication order. Offsets are persisted by the pipeline's own
//! state files, not by the broker, so a consumer resumes exactly where its
//! cache says it stopped.
//!
//! ## Cargo features
//!
//! - `kafka` (default): the rdkafka-backed implementation. The in-memory
//!   bus and the traits build without it.

pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod traits;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use config::{KafkaConfig, SaslCredentials, SecurityProtocol};
pub use envelope::{encode_event, BusMessage};
pub use error::{BusError, BusResult};
pub use memory::{MemoryBus, MemoryBusConsumer, MemoryBusProducer};
pub use traits::{
    BoxedBusConsumer, BoxedBusProducer, BusConsumer, BusProducer, RECONNECT_BACKOFF,
};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBusConsumer, KafkaBusProducer};
