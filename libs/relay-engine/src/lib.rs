pub mod bootstrap;
pub mod config;
pub mod delivery;
pub mod error;
pub mod gate;
pub mod ingress;
pub mod pipeline;

pub use bootstrap::Engine;
pub use config::{OverflowPolicy, RelayConfig};
pub use delivery::{DeliveryError, ResultSink, StreamEnd, StreamSummary, first_result, forward_all};
pub use error::EngineError;
pub use gate::{Denial, DenialCounts, Gate};
pub use ingress::{Ingress, IngressError, IngressStats};
pub use pipeline::{Egress, PipelineHandle};

#[cfg(test)]
pub(crate) mod test_support {
    use std::future::Future;
    use std::pin::Pin;

    use relay_api::{Broker, BrokerError, BrokerReader, StartOffset};

    /// Writes never complete; consumers cannot be opened.
    pub struct PendingBroker;

    impl Broker for PendingBroker {
        fn write(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
            Box::pin(std::future::pending())
        }

        fn open_consumer(
            &self,
            topic: &str,
            _group: &str,
            _start: StartOffset,
        ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BrokerReader>, BrokerError>> + Send + '_>>
        {
            let topic = topic.to_string();
            Box::pin(async move { Err(BrokerError::closed(format!("no consumer for '{topic}'"))) })
        }
    }
}
