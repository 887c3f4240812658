use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast;

use relay_api::{Broker, BrokerError, BrokerReader, RawRecord, StartOffset};

// ═══════════════════════════════════════════════════════════════
//  MemoryBrokerConfig
// ═══════════════════════════════════════════════════════════════

fn default_max_records() -> usize {
    100_000
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MemoryBrokerConfig {
    /// Records retained per topic; older records are discarded.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  TopicLog
// ═══════════════════════════════════════════════════════════════

/// Append-only retained log of one topic.
struct TopicLog {
    entries: RwLock<LogEntries>,
    /// Unit signal broadcast on every append.
    notify_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

struct LogEntries {
    /// Offset of `records[0]`.
    base: u64,
    records: VecDeque<Vec<u8>>,
}

impl LogEntries {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }
}

impl TopicLog {
    fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(LogEntries {
                base: 0,
                records: VecDeque::new(),
            }),
            notify_tx,
            closed: AtomicBool::new(false),
        }
    }

    fn append(&self, payload: Vec<u8>, max_records: usize) {
        {
            let mut entries = self.entries.write().unwrap_or_else(|poisoned| {
                tracing::warn!("topic log write lock was poisoned, recovering");
                poisoned.into_inner()
            });
            if entries.records.len() >= max_records {
                entries.records.pop_front();
                entries.base += 1;
            }
            entries.records.push_back(payload);
        }
        // No receivers is fine.
        let _ = self.notify_tx.send(());
    }

    /// Record at `offset`, clamped forward to the oldest retained one.
    fn get(&self, offset: u64) -> Option<RawRecord> {
        let entries = self.entries.read().unwrap_or_else(|poisoned| {
            tracing::warn!("topic log read lock was poisoned, recovering");
            poisoned.into_inner()
        });
        let offset = offset.max(entries.base);
        let idx = usize::try_from(offset - entries.base).ok()?;
        entries.records.get(idx).map(|payload| RawRecord {
            payload: payload.clone(),
            offset,
        })
    }

    fn end(&self) -> u64 {
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.end()
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

struct Inner {
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    /// Committed position per (topic, group).
    committed: Mutex<HashMap<(String, String), u64>>,
    open_readers: AtomicUsize,
    max_records: usize,
}

/// In-process broker: one retained log per topic, independent position
/// per consumer group. Topics are created on first use.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerConfig::default())
    }
}

impl MemoryBroker {
    pub fn new(config: MemoryBrokerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                open_readers: AtomicUsize::new(0),
                max_records: config.max_records.max(1),
            }),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        {
            let topics = self.inner.topics.read().unwrap_or_else(|poisoned| {
                tracing::warn!("broker topic map read lock was poisoned, recovering");
                poisoned.into_inner()
            });
            if let Some(log) = topics.get(name) {
                return log.clone();
            }
        }
        let mut topics = self.inner.topics.write().unwrap_or_else(|poisoned| {
            tracing::warn!("broker topic map write lock was poisoned, recovering");
            poisoned.into_inner()
        });
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(topic = %name, "created topic");
                Arc::new(TopicLog::new())
            })
            .clone()
    }

    /// Number of readers currently bound (not yet closed or dropped).
    pub fn open_readers(&self) -> usize {
        self.inner.open_readers.load(Ordering::SeqCst)
    }

    /// Number of records ever appended to `topic`.
    pub fn topic_len(&self, topic: &str) -> u64 {
        self.topic(topic).end()
    }

    /// Close a topic: every bound reader fails its next read.
    pub fn close_topic(&self, topic: &str) {
        let log = self.topic(topic);
        log.closed.store(true, Ordering::SeqCst);
        let _ = log.notify_tx.send(());
    }
}

impl Broker for MemoryBroker {
    fn write(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + '_>> {
        let log = self.topic(topic);
        let topic = topic.to_string();
        Box::pin(async move {
            if log.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::closed(format!("topic '{topic}' is closed")));
            }
            log.append(payload, self.inner.max_records);
            Ok(())
        })
    }

    fn open_consumer(
        &self,
        topic: &str,
        group: &str,
        start: StartOffset,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn BrokerReader>, BrokerError>> + Send + '_>> {
        let log = self.topic(topic);
        let key = (topic.to_string(), group.to_string());
        Box::pin(async move {
            // Subscribe before resolving the position so no append is missed.
            let notify_rx = log.notify_tx.subscribe();
            let committed = {
                let committed = self.inner.committed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                committed.get(&key).copied()
            };
            let offset = match (committed, start) {
                (Some(offset), _) => offset,
                (None, StartOffset::Earliest) => 0,
                (None, StartOffset::Latest) => log.end(),
            };
            self.inner.open_readers.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(topic = %key.0, group = %key.1, offset, "consumer bound");
            Ok(Box::new(MemoryReader {
                log,
                key,
                offset,
                notify_rx,
                inner: self.inner.clone(),
            }) as Box<dyn BrokerReader>)
        })
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryReader
// ═══════════════════════════════════════════════════════════════

pub struct MemoryReader {
    log: Arc<TopicLog>,
    key: (String, String),
    offset: u64,
    notify_rx: broadcast::Receiver<()>,
    inner: Arc<Inner>,
}

impl BrokerReader for MemoryReader {
    fn read_next(&mut self) -> Pin<Box<dyn Future<Output = Result<RawRecord, BrokerError>> + Send + '_>> {
        Box::pin(async move {
            loop {
                if self.log.closed.load(Ordering::SeqCst) {
                    return Err(BrokerError::closed(format!("topic '{}' is closed", self.key.0)));
                }
                if let Some(record) = self.log.get(self.offset) {
                    self.offset = record.offset + 1;
                    return Ok(record);
                }
                // No data yet: wait for an append. Lag only means we re-read.
                match self.notify_rx.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BrokerError::closed(format!("topic '{}' is gone", self.key.0)));
                    }
                }
            }
        })
    }

    fn close(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut committed = self.inner.committed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            committed.insert(self.key.clone(), self.offset);
            tracing::debug!(topic = %self.key.0, group = %self.key.1, offset = self.offset, "consumer released");
        })
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        self.inner.open_readers.fetch_sub(1, Ordering::SeqCst);
    }
}
