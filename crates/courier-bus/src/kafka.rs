//! Kafka bus implementation
//!
//! Producer publishes with `acks=all` and returns the assigned offset from
//! the delivery report. Consumer owns partition 0 of the event topic and
//! seeks by absolute offset; offsets are committed by the pipeline through
//! its own persisted state, never by the broker.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::Message;
use tracing::{debug, info, instrument};

use courier_core::Event;

use crate::config::KafkaConfig;
use crate::envelope::{encode_event, BusMessage};
use crate::error::{BusError, BusResult};
use crate::traits::{BusConsumer, BusProducer};

/// The single partition Courier publishes to and consumes from.
const PARTITION: i32 = 0;

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id)
        .set("security.protocol", config.security_protocol.as_str());
    if let Some(sasl) = &config.sasl {
        client
            .set("sasl.mechanism", &sasl.mechanism)
            .set("sasl.username", &sasl.username)
            .set("sasl.password", &sasl.password);
    }
    client
}

/// Kafka publishing side.
pub struct KafkaBusProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaBusProducer {
    pub fn new(config: &KafkaConfig) -> BusResult<KafkaBusProducer> {
        let mut client = base_client_config(config);
        client
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .set("enable.idempotence", "true");

        let producer: FutureProducer =
            client.create().map_err(|e| BusError::ConnectionFailed {
                broker: config.bootstrap_servers.clone(),
                cause: e.to_string(),
            })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.topic,
            "kafka producer created"
        );
        Ok(KafkaBusProducer {
            producer,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl BusProducer for KafkaBusProducer {
    #[instrument(skip(self, event), fields(op = %event.op, topic = %self.topic))]
    async fn publish(&self, event: &Event) -> BusResult<i64> {
        let payload = encode_event(event)?;
        let key = event.entity.clone().unwrap_or_default();
        let record = FutureRecord::to(&self.topic)
            .partition(PARTITION)
            .key(&key)
            .payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, Duration::from_secs(30))
            .await
            .map_err(|(err, _)| BusError::PublishFailed {
                topic: self.topic.clone(),
                cause: err.to_string(),
            })?;

        debug!(partition, offset, "event published");
        Ok(offset)
    }
}

/// Kafka consuming side.
pub struct KafkaBusConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaBusConsumer {
    pub fn new(config: &KafkaConfig) -> BusResult<KafkaBusConsumer> {
        let group_id = config
            .group_id
            .clone()
            .ok_or_else(|| BusError::ConnectionFailed {
                broker: config.bootstrap_servers.clone(),
                cause: "consumer requires a group_id".to_string(),
            })?;

        let mut client = base_client_config(config);
        client
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        let consumer: StreamConsumer =
            client.create().map_err(|e| BusError::ConnectionFailed {
                broker: config.bootstrap_servers.clone(),
                cause: e.to_string(),
            })?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&config.topic, PARTITION, Offset::Beginning)
            .map_err(|e| BusError::SeekFailed {
                cause: e.to_string(),
            })?;
        consumer.assign(&assignment).map_err(|e| BusError::SeekFailed {
            cause: e.to_string(),
        })?;

        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.topic,
            group_id = %group_id,
            "kafka consumer created"
        );
        Ok(KafkaBusConsumer {
            consumer,
            topic: config.topic.clone(),
        })
    }

    fn seek_to(&self, offset: Offset) -> BusResult<()> {
        self.consumer
            .seek(&self.topic, PARTITION, offset, Duration::from_secs(10))
            .map_err(|e| BusError::SeekFailed {
                cause: e.to_string(),
            })
    }
}

#[async_trait]
impl BusConsumer for KafkaBusConsumer {
    async fn seek(&self, offset: i64) -> BusResult<()> {
        self.seek_to(Offset::Offset(offset))
    }

    async fn seek_to_beginning(&self) -> BusResult<()> {
        self.seek_to(Offset::Beginning)
    }

    async fn poll(&self, timeout: Duration) -> BusResult<Option<BusMessage>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(e)) => Err(BusError::ConsumeFailed {
                cause: e.to_string(),
            }),
            Ok(Ok(message)) => {
                let payload = message.payload().unwrap_or_default();
                let timestamp = message
                    .timestamp()
                    .to_millis()
                    .and_then(chrono::DateTime::from_timestamp_millis)
                    .unwrap_or_else(chrono::Utc::now);
                BusMessage::from_payload(message.offset(), timestamp, payload).map(Some)
            }
        }
    }
}
