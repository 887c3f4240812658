pub mod error;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub use error::{BrokerError, ErrorKind};

// ════════════════════════════════════════════════════════════════
//  Stream identity
// ════════════════════════════════════════════════════════════════

/// Opaque identity of one logical stream. Doubles as the broker topic name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Fresh random identity for a newly started stream.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Broker topic backing this stream.
    pub fn topic(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ════════════════════════════════════════════════════════════════
//  Records
// ════════════════════════════════════════════════════════════════

/// One record as delivered by the broker for a stream's topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRecord {
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Position of the record in the stream's log.
    pub offset: u64,
}

/// Client-visible result derived from exactly one [`RawRecord`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedResult {
    /// Per-pipeline sequence number, starting at 1.
    pub sequence: u64,
    pub processed_at: DateTime<Utc>,
    /// Source payload rendered as text.
    pub data: String,
}

impl std::fmt::Display for ProcessedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message #{} - Processed at {}: {}",
            self.sequence,
            self.processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.data
        )
    }
}

// ════════════════════════════════════════════════════════════════
//  Broker traits
// ════════════════════════════════════════════════════════════════

/// Where a freshly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    /// Beginning of the retained log.
    #[default]
    Earliest,
    /// Only records written after the consumer is bound.
    Latest,
}

/// Log-structured message broker, shared by the whole process.
///
/// Implementations: in-memory log (tests, single node), Kafka.
pub trait Broker: Send + Sync {
    /// Append one payload to `topic`.
    fn write(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>>;

    /// Bind a new reader to `topic` under consumer group `group`.
    ///
    /// Distinct groups see independent copies of the log; `start` only
    /// matters when the group has no committed position yet.
    #[allow(clippy::type_complexity)]
    fn open_consumer(
        &self,
        topic: &str,
        group: &str,
        start: StartOffset,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BrokerReader>, BrokerError>> + Send + '_>>;
}

/// Reader bound to one topic and consumer group.
pub trait BrokerReader: Send {
    /// Wait for the next record. Cancel by dropping the future.
    fn read_next(&mut self) -> Pin<Box<dyn Future<Output = Result<RawRecord, BrokerError>> + Send + '_>>;

    /// Release the consumer. Must be called once, on every exit path.
    fn close(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}
