//! In-memory bus
//!
//! A loopback FIFO used by the test suite and the end-to-end scenarios: a
//! shared append-only log with per-consumer positions. Delivery semantics
//! match the real bus (at-least-once, offset seek, FIFO).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use courier_core::Event;

use crate::envelope::BusMessage;
use crate::error::BusResult;
use crate::traits::{BusConsumer, BusProducer};

type Log = Arc<Mutex<Vec<(Event, DateTime<Utc>)>>>;

/// Shared in-memory event log.
#[derive(Clone, Default)]
pub struct MemoryBus {
    log: Log,
}

impl MemoryBus {
    pub fn new() -> MemoryBus {
        MemoryBus::default()
    }

    /// Publishing handle on this log.
    pub fn producer(&self) -> MemoryBusProducer {
        MemoryBusProducer {
            log: self.log.clone(),
        }
    }

    /// Consuming handle on this log, positioned at the beginning.
    pub fn consumer(&self) -> MemoryBusConsumer {
        MemoryBusConsumer {
            log: self.log.clone(),
            position: Arc::new(Mutex::new(0)),
        }
    }

    /// Number of events published so far.
    pub async fn len(&self) -> usize {
        self.log.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.log.lock().await.is_empty()
    }

    /// Snapshot of all published events, for assertions.
    pub async fn events(&self) -> Vec<Event> {
        self.log
            .lock()
            .await
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }
}

/// Publishing side of the in-memory bus.
#[derive(Clone)]
pub struct MemoryBusProducer {
    log: Log,
}

#[async_trait]
impl BusProducer for MemoryBusProducer {
    async fn publish(&self, event: &Event) -> BusResult<i64> {
        let mut log = self.log.lock().await;
        log.push((event.clone(), Utc::now()));
        Ok((log.len() - 1) as i64)
    }
}

/// Consuming side of the in-memory bus.
#[derive(Clone)]
pub struct MemoryBusConsumer {
    log: Log,
    position: Arc<Mutex<i64>>,
}

#[async_trait]
impl BusConsumer for MemoryBusConsumer {
    async fn seek(&self, offset: i64) -> BusResult<()> {
        *self.position.lock().await = offset.max(0);
        Ok(())
    }

    async fn seek_to_beginning(&self) -> BusResult<()> {
        *self.position.lock().await = 0;
        Ok(())
    }

    async fn poll(&self, _timeout: Duration) -> BusResult<Option<BusMessage>> {
        let mut position = self.position.lock().await;
        let log = self.log.lock().await;
        let index = *position as usize;
        match log.get(index) {
            Some((event, timestamp)) => {
                *position += 1;
                Ok(Some(BusMessage {
                    offset: index as i64,
                    timestamp: *timestamp,
                    event: event.clone(),
                }))
            }
            None => Ok(None),
        }
    }
}
