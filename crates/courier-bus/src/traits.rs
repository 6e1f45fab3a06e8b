//! Bus producer/consumer traits
//!
//! The bus is an at-least-once FIFO per consumer group. Producers get the
//! assigned offset back with the acknowledgement; consumers seek by offset
//! and poll one message at a time, preserving publication order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use courier_core::Event;

use crate::envelope::BusMessage;
use crate::error::BusResult;

/// Fixed backoff applied when the bus is unavailable.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Publishing side of the bus.
#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Publish one event and wait for the acknowledgement. Returns the
    /// assigned offset.
    async fn publish(&self, event: &Event) -> BusResult<i64>;
}

/// Consuming side of the bus.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Position the consumer so the next poll returns the message at
    /// `offset` (or the first one after it).
    async fn seek(&self, offset: i64) -> BusResult<()>;

    /// Position the consumer at the oldest retained message.
    async fn seek_to_beginning(&self) -> BusResult<()>;

    /// Wait up to `timeout` for the next message.
    async fn poll(&self, timeout: Duration) -> BusResult<Option<BusMessage>>;
}

pub type BoxedBusProducer = Arc<dyn BusProducer>;
pub type BoxedBusConsumer = Arc<dyn BusConsumer>;
