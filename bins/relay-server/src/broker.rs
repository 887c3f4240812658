use std::sync::Arc;

use relay_api::Broker;
use relay_broker_memory::{MemoryBroker, MemoryBrokerConfig};
use relay_engine::EngineError;
use relay_engine::config::{BrokerConfig, BrokerKind};

/// Build the broker selected by `[broker] kind`.
pub fn create_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>, EngineError> {
    match config.kind {
        BrokerKind::Memory => {
            tracing::info!(max_records = config.max_records, "using in-memory broker");
            Ok(Arc::new(MemoryBroker::new(MemoryBrokerConfig {
                max_records: config.max_records,
            })))
        }
        BrokerKind::Kafka => create_kafka(config),
    }
}

#[cfg(feature = "kafka")]
fn create_kafka(config: &BrokerConfig) -> Result<Arc<dyn Broker>, EngineError> {
    use relay_broker_kafka::{KafkaBroker, KafkaBrokerConfig};

    tracing::info!(brokers = %config.brokers, "using kafka broker");
    let broker = KafkaBroker::new(KafkaBrokerConfig {
        brokers: config.brokers.clone(),
        write_timeout: config.write_timeout(),
    })?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "kafka"))]
fn create_kafka(_config: &BrokerConfig) -> Result<Arc<dyn Broker>, EngineError> {
    Err(EngineError::Config(
        "broker.kind = \"kafka\" requires relay-server built with the `kafka` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_is_the_default() {
        assert!(create_broker(&BrokerConfig::default()).is_ok());
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn kafka_without_feature_is_a_config_error() {
        let config = BrokerConfig {
            kind: BrokerKind::Kafka,
            ..BrokerConfig::default()
        };
        let err = create_broker(&config).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
