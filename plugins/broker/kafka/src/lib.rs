//! Kafka-backed broker: one shared `FutureProducer` for writes, one
//! `StreamConsumer` per opened reader.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};

use relay_api::{Broker, BrokerError, BrokerReader, RawRecord, StartOffset};

#[derive(Debug, Clone)]
pub struct KafkaBrokerConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    /// Producer delivery timeout.
    pub write_timeout: Duration,
}

pub struct KafkaBroker {
    producer: FutureProducer,
    config: KafkaBrokerConfig,
}

impl KafkaBroker {
    /// Create the shared producer. Does not contact the cluster.
    pub fn new(config: KafkaBrokerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.write_timeout.as_millis().to_string())
            .create()
            .map_err(|e| BrokerError::config(format!("failed to create kafka producer: {e}")))?;

        tracing::info!(brokers = %config.brokers, "kafka producer created");
        Ok(Self { producer, config })
    }

    fn consumer_config(&self, group: &str, start: StartOffset) -> ClientConfig {
        let mut cfg = ClientConfig::new();
        cfg.set("bootstrap.servers", &self.config.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", offset_reset(start))
            .set("enable.partition.eof", "false");
        cfg
    }
}

fn offset_reset(start: StartOffset) -> &'static str {
    match start {
        StartOffset::Earliest => "earliest",
        StartOffset::Latest => "latest",
    }
}

impl Broker for KafkaBroker {
    fn write(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let topic = topic.to_string();
        Box::pin(async move {
            let record = FutureRecord::to(&topic)
                .key(topic.as_str())
                .payload(payload.as_slice());
            self.producer
                .send(record, self.config.write_timeout)
                .await
                .map(|_| ())
                .map_err(|(e, _)| BrokerError::io(format!("kafka write to '{topic}' failed: {e}")))
        })
    }

    fn open_consumer(
        &self,
        topic: &str,
        group: &str,
        start: StartOffset,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BrokerReader>, BrokerError>> + Send + '_>> {
        let topic = topic.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let consumer: StreamConsumer = self
                .consumer_config(&group, start)
                .create()
                .map_err(|e| BrokerError::config(format!("failed to create kafka consumer: {e}")))?;
            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| BrokerError::io(format!("failed to subscribe to '{topic}': {e}")))?;

            tracing::debug!(topic = %topic, group = %group, "kafka consumer bound");
            Ok(Box::new(KafkaReader { consumer, topic }) as Box<dyn BrokerReader>)
        })
    }
}

pub struct KafkaReader {
    consumer: StreamConsumer,
    topic: String,
}

impl BrokerReader for KafkaReader {
    fn read_next(&mut self) -> Pin<Box<dyn Future<Output = Result<RawRecord, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            let msg = self
                .consumer
                .recv()
                .await
                .map_err(|e| BrokerError::io(format!("kafka read from '{}' failed: {e}", self.topic)))?;
            Ok(RawRecord {
                payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                offset: u64::try_from(msg.offset()).unwrap_or_default(),
            })
        })
    }

    fn close(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.consumer.unsubscribe();
            tracing::debug!(topic = %self.topic, "kafka consumer released");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_offset_maps_to_reset_policy() {
        assert_eq!(offset_reset(StartOffset::Earliest), "earliest");
        assert_eq!(offset_reset(StartOffset::Latest), "latest");
    }

    #[test]
    fn consumer_config_carries_group_and_reset() {
        let broker = KafkaBroker::new(KafkaBrokerConfig {
            brokers: "localhost:9092".into(),
            write_timeout: Duration::from_secs(5),
        })
        .unwrap();
        let cfg = broker.consumer_config("consumer-group-s1-abc", StartOffset::Latest);
        assert_eq!(cfg.get("group.id"), Some("consumer-group-s1-abc"));
        assert_eq!(cfg.get("auto.offset.reset"), Some("latest"));
        assert_eq!(cfg.get("enable.auto.commit"), Some("true"));
    }
}
