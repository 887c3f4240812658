use std::sync::Arc;

use relay_api::{Broker, StreamId};

use crate::config::RelayConfig;
use crate::error::EngineError;
use crate::gate::Gate;
use crate::ingress::Ingress;
use crate::pipeline::Egress;

/// The running engine: admission gate, ingress writers and the pipeline
/// factory, all over one shared broker.
pub struct Engine {
    gate: Gate,
    ingress: Ingress,
    egress: Egress,
    config: RelayConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("gate", &self.gate)
            .field("ingress", &self.ingress)
            .field("config", &self.config)
            .finish()
    }
}

impl Engine {
    /// Bootstrap the engine from a parsed configuration.
    ///
    /// Spawns the ingress worker pool, so this must run inside a tokio
    /// runtime.
    pub async fn bootstrap(config: RelayConfig, broker: Arc<dyn Broker>) -> Result<Self, EngineError> {
        config.validate()?;

        let gate = Gate::new(&config.auth, &config.rate_limit);
        let ingress = Ingress::new(
            Arc::clone(&broker),
            &config.ingress,
            config.broker.write_timeout(),
        );
        let egress = Egress::new(broker, config.egress.clone());

        tracing::info!(
            broker = ?config.broker.kind,
            per_second = config.rate_limit.per_second,
            burst = config.rate_limit.burst,
            start_from = ?config.egress.start_from,
            "engine ready"
        );

        Ok(Engine {
            gate,
            ingress,
            egress,
            config,
        })
    }

    pub fn gate(&self) -> &Gate {
        &self.gate
    }

    pub fn ingress(&self) -> &Ingress {
        &self.ingress
    }

    pub fn egress(&self) -> &Egress {
        &self.egress
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Identity for a newly started stream. Nothing is registered; the
    /// topic comes into existence on first write.
    pub fn start_stream(&self) -> StreamId {
        let stream = StreamId::generate();
        tracing::info!(stream = %stream, "stream started");
        stream
    }

    /// Drain the ingress queue. In-flight pipelines are owned by their
    /// requests and stop on their own.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down engine");
        self.ingress.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use relay_broker_memory::MemoryBroker;

    use super::*;
    use crate::config::AuthConfig;

    #[tokio::test]
    async fn start_gives_distinct_identities() {
        let engine = Engine::bootstrap(RelayConfig::default(), Arc::new(MemoryBroker::default()))
            .await
            .unwrap();
        let ids: HashSet<StreamId> = (0..100).map(|_| engine.start_stream()).collect();
        assert_eq!(ids.len(), 100);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = RelayConfig::default();
        config.egress.buffer = 0;
        let err = Engine::bootstrap(config, Arc::new(MemoryBroker::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn shutdown_flushes_accepted_payloads() {
        let broker = MemoryBroker::default();
        let config = RelayConfig {
            auth: AuthConfig {
                api_key: Some("k".into()),
            },
            ..RelayConfig::default()
        };
        let engine = Engine::bootstrap(config, Arc::new(broker.clone())).await.unwrap();

        let stream = engine.start_stream();
        for i in 0..10 {
            let body = format!(r#"{{"n":{i}}}"#);
            engine.ingress().accept(&stream, body.as_bytes()).await.unwrap();
        }
        engine.shutdown().await;
        assert_eq!(broker.topic_len(stream.topic()), 10);
    }
}
