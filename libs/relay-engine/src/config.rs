use std::time::Duration;

use serde::Deserialize;

use relay_api::StartOffset;

use crate::error::EngineError;

/// Root configuration, parsed from TOML. Every field has a default, so an
/// empty document is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// HTTP + WebSocket API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub ingress: IngressConfig,

    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_api_port() -> u16 {
    8080
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            ingress: IngressConfig::default(),
            egress: EgressConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared secret expected in `X-API-Key`. Unset means every request is
    /// rejected.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Token refill rate per client, in tokens per second.
    #[serde(default = "default_per_second")]
    pub per_second: f64,
    /// Bucket capacity (burst).
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Client buckets kept before the least recently used one is evicted.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Prefer `X-Forwarded-For` over the socket peer address.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_per_second() -> f64 {
    10.0
}
fn default_burst() -> u32 {
    20
}
fn default_max_clients() -> usize {
    10_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: default_per_second(),
            burst: default_burst(),
            max_clients: default_max_clients(),
            trust_forwarded_for: false,
        }
    }
}

/// What the ingress does when its write queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): drop the write and log it; the request is still accepted.
    Drop,
    /// .send().await: the request waits for queue space.
    #[serde(alias = "backpressure")]
    BackPressure,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    /// Capacity of the write queue.
    #[serde(default = "default_ingress_queue")]
    pub queue: usize,
    /// Worker tasks draining the queue.
    #[serde(default = "default_ingress_workers")]
    pub workers: usize,
    #[serde(default = "default_ingress_overflow")]
    pub overflow: OverflowPolicy,
}

fn default_ingress_queue() -> usize {
    1024
}
fn default_ingress_workers() -> usize {
    4
}
fn default_ingress_overflow() -> OverflowPolicy {
    OverflowPolicy::BackPressure
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            queue: default_ingress_queue(),
            workers: default_ingress_workers(),
            overflow: default_ingress_overflow(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// Capacity of each pipeline's result channel.
    #[serde(default = "default_egress_buffer")]
    pub buffer: usize,
    /// Bounded wait of `GET /stream/{id}/results`.
    #[serde(default = "default_result_timeout_ms")]
    pub result_timeout_ms: u64,
    /// Where a new pipeline's consumer group starts reading.
    #[serde(default)]
    pub start_from: StartOffset,
    /// Consumer group prefix; the stream id and a unique suffix are appended.
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
}

fn default_egress_buffer() -> usize {
    5
}
fn default_result_timeout_ms() -> u64 {
    5000
}
fn default_group_prefix() -> String {
    "consumer-group".into()
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            buffer: default_egress_buffer(),
            result_timeout_ms: default_result_timeout_ms(),
            start_from: StartOffset::default(),
            group_prefix: default_group_prefix(),
        }
    }
}

impl EgressConfig {
    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    #[default]
    Memory,
    Kafka,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    /// Kafka bootstrap servers.
    #[serde(default = "default_brokers")]
    pub brokers: String,
    /// Upper bound on a single broker write.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Records retained per topic by the memory broker.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_brokers() -> String {
    "localhost:9092".into()
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_max_records() -> usize {
    100_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            brokers: default_brokers(),
            write_timeout_ms: default_write_timeout_ms(),
            max_records: default_max_records(),
        }
    }
}

impl BrokerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl RelayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{path}: {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.rate_limit.per_second > 0.0 && self.rate_limit.per_second.is_finite()) {
            return Err(EngineError::Config(format!(
                "rate_limit.per_second must be positive, got {}",
                self.rate_limit.per_second
            )));
        }
        let non_zero = [
            ("rate_limit.burst", u64::from(self.rate_limit.burst)),
            ("rate_limit.max_clients", self.rate_limit.max_clients as u64),
            ("ingress.queue", self.ingress.queue as u64),
            ("ingress.workers", self.ingress.workers as u64),
            ("egress.buffer", self.egress.buffer as u64),
            ("egress.result_timeout_ms", self.egress.result_timeout_ms),
            ("broker.write_timeout_ms", self.broker.write_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RelayConfig::parse("").unwrap();
        assert_eq!(config.api_port, 8080);
        assert!(config.auth.api_key.is_none());
        assert_eq!(config.rate_limit.per_second, 10.0);
        assert_eq!(config.rate_limit.burst, 20);
        assert_eq!(config.egress.buffer, 5);
        assert_eq!(config.egress.result_timeout(), Duration::from_secs(5));
        assert_eq!(config.egress.start_from, StartOffset::Earliest);
        assert_eq!(config.egress.group_prefix, "consumer-group");
        assert_eq!(config.ingress.overflow, OverflowPolicy::BackPressure);
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.broker.write_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn sections_override_defaults() {
        let config = RelayConfig::parse(
            r#"
            api_port = 9000

            [auth]
            api_key = "secret"

            [rate_limit]
            per_second = 2.5
            burst = 4

            [ingress]
            workers = 2
            overflow = "drop"

            [egress]
            start_from = "latest"
            result_timeout_ms = 250

            [broker]
            kind = "kafka"
            brokers = "kafka-1:9092,kafka-2:9092"
            "#,
        )
        .unwrap();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.auth.api_key.as_deref(), Some("secret"));
        assert_eq!(config.rate_limit.per_second, 2.5);
        assert_eq!(config.rate_limit.burst, 4);
        assert_eq!(config.ingress.workers, 2);
        assert_eq!(config.ingress.overflow, OverflowPolicy::Drop);
        assert_eq!(config.egress.start_from, StartOffset::Latest);
        assert_eq!(config.egress.result_timeout(), Duration::from_millis(250));
        assert_eq!(config.broker.kind, BrokerKind::Kafka);
        assert_eq!(config.broker.brokers, "kafka-1:9092,kafka-2:9092");
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = RelayConfig::parse("[ingress]\nworkers = 0\n").unwrap_err();
        assert!(err.to_string().contains("ingress.workers"));

        let err = RelayConfig::parse("[rate_limit]\nper_second = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("per_second"));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = RelayConfig::parse("[egress]\nresult_timeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("egress.result_timeout_ms"));

        let err = RelayConfig::parse("[broker]\nwrite_timeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("broker.write_timeout_ms"));
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let config = RelayConfig::parse("[auth]\napi_key = \"hunter2\"\n").unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
