//! Ingress: validate a client payload and hand it to the broker writers.
//!
//! Acceptance only means the payload was queued. A fixed pool of worker
//! tasks drains the queue; broker failures are logged and counted, never
//! reported back to the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use relay_api::{Broker, StreamId};

use crate::config::{IngressConfig, OverflowPolicy};

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Invalid or missing JSON data")]
    BadRequest(String),

    #[error("ingress is shut down")]
    Closed,
}

/// One queued broker write.
#[derive(Debug)]
struct WriteJob {
    stream: StreamId,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    pub accepted: u64,
    pub dropped: u64,
    pub written: u64,
    pub write_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    write_failures: AtomicU64,
}

pub struct Ingress {
    tx: Mutex<Option<mpsc::Sender<WriteJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    overflow: OverflowPolicy,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for Ingress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingress")
            .field("overflow", &self.overflow)
            .field("workers", &self.workers.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Ingress {
    /// Spawn `config.workers` writer tasks. Must be called inside a tokio runtime.
    pub fn new(broker: Arc<dyn Broker>, config: &IngressConfig, write_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(config.queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers.max(1))
            .map(|id| {
                tokio::spawn(write_worker(
                    id,
                    Arc::clone(&broker),
                    Arc::clone(&rx),
                    Arc::clone(&counters),
                    write_timeout,
                ))
            })
            .collect();

        tracing::debug!(
            queue = config.queue,
            workers = config.workers,
            overflow = ?config.overflow,
            "ingress started"
        );

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            overflow: config.overflow,
            counters,
        }
    }

    /// Validate `body` and queue it for `stream`'s topic.
    ///
    /// The body must be a JSON object with at least one key. It is
    /// re-serialized compactly before queueing.
    pub async fn accept(&self, stream: &StreamId, body: &[u8]) -> Result<(), IngressError> {
        let payload = normalize(body)?;

        let Some(tx) = self.tx.lock().clone() else {
            return Err(IngressError::Closed);
        };
        let job = WriteJob {
            stream: stream.clone(),
            payload,
        };

        match self.overflow {
            OverflowPolicy::BackPressure => {
                tx.send(job).await.map_err(|_| IngressError::Closed)?;
            }
            OverflowPolicy::Drop => match tx.try_send(job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(job)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(stream = %job.stream, "write queue full, payload dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(IngressError::Closed),
            },
        }

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close the queue and wait until the workers have drained it.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "ingress worker panicked");
            }
        }
        tracing::debug!(stats = ?self.stats(), "ingress drained");
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }
}

fn normalize(body: &[u8]) -> Result<Vec<u8>, IngressError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| IngressError::BadRequest(e.to_string()))?;
    match value {
        serde_json::Value::Object(map) if !map.is_empty() => serde_json::to_vec(&map)
            .map_err(|e| IngressError::BadRequest(e.to_string())),
        serde_json::Value::Object(_) => Err(IngressError::BadRequest("empty object".into())),
        _ => Err(IngressError::BadRequest("expected a JSON object".into())),
    }
}

async fn write_worker(
    id: usize,
    broker: Arc<dyn Broker>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WriteJob>>>,
    counters: Arc<Counters>,
    write_timeout: Duration,
) {
    loop {
        // Only the receive is under the lock; the write runs unlocked.
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let topic = job.stream.topic();
        match tokio::time::timeout(write_timeout, broker.write(topic, job.payload)).await {
            Ok(Ok(())) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker = id, stream = %job.stream, error = %e, "broker write failed");
            }
            Err(_) => {
                counters.write_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    worker = id,
                    stream = %job.stream,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "broker write timed out"
                );
            }
        }
    }
    tracing::debug!(worker = id, "ingress worker stopped");
}

#[cfg(test)]
mod tests {
    use relay_api::{BrokerReader, StartOffset};
    use relay_broker_memory::MemoryBroker;

    use super::*;
    use crate::test_support::PendingBroker;

    fn config(queue: usize, workers: usize, overflow: OverflowPolicy) -> IngressConfig {
        IngressConfig {
            queue,
            workers,
            overflow,
        }
    }

    #[tokio::test]
    async fn accepted_payload_reaches_the_topic_compacted() {
        let broker = MemoryBroker::default();
        let ingress = Ingress::new(
            Arc::new(broker.clone()),
            &IngressConfig::default(),
            Duration::from_secs(5),
        );
        let stream = StreamId::from("s1");

        ingress
            .accept(&stream, br#"{ "key" : "value" }"#)
            .await
            .unwrap();
        ingress.shutdown().await;

        assert_eq!(broker.topic_len("s1"), 1);
        let mut reader = broker
            .open_consumer("s1", "check", StartOffset::Earliest)
            .await
            .unwrap();
        let record = reader.read_next().await.unwrap();
        assert_eq!(record.payload, br#"{"key":"value"}"#);
        reader.close().await;

        let stats = ingress.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.written, 1);
    }

    #[tokio::test]
    async fn non_object_bodies_are_rejected_before_the_broker() {
        let broker = MemoryBroker::default();
        let ingress = Ingress::new(
            Arc::new(broker.clone()),
            &IngressConfig::default(),
            Duration::from_secs(5),
        );
        let stream = StreamId::from("s1");

        let bodies: [&[u8]; 7] = [b"", b"not json", b"[1,2]", b"\"text\"", b"42", b"{}", b"null"];
        for body in bodies {
            let err = ingress.accept(&stream, body).await.unwrap_err();
            assert!(matches!(err, IngressError::BadRequest(_)), "{body:?}");
        }
        ingress.shutdown().await;
        assert_eq!(broker.topic_len("s1"), 0);
        assert_eq!(ingress.stats().accepted, 0);
    }

    #[tokio::test]
    async fn acceptance_does_not_wait_for_the_broker() {
        let ingress = Ingress::new(
            Arc::new(PendingBroker),
            &config(4, 1, OverflowPolicy::BackPressure),
            Duration::from_secs(3600),
        );
        let stream = StreamId::from("s1");

        let accepted = tokio::time::timeout(
            Duration::from_secs(1),
            ingress.accept(&stream, br#"{"a":1}"#),
        )
        .await;
        assert!(matches!(accepted, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn drop_policy_discards_when_full() {
        let ingress = Ingress::new(
            Arc::new(PendingBroker),
            &config(1, 1, OverflowPolicy::Drop),
            Duration::from_secs(3600),
        );
        let stream = StreamId::from("s1");

        for _ in 0..5 {
            ingress.accept(&stream, br#"{"a":1}"#).await.unwrap();
        }
        // One job held by the stuck worker, one in the queue at most.
        let stats = ingress.stats();
        assert_eq!(stats.accepted, 5);
        assert!(stats.dropped >= 3, "{stats:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_writes_time_out_and_are_counted() {
        let ingress = Ingress::new(
            Arc::new(PendingBroker),
            &config(4, 1, OverflowPolicy::BackPressure),
            Duration::from_secs(5),
        );
        ingress
            .accept(&StreamId::from("s1"), br#"{"a":1}"#)
            .await
            .unwrap();
        ingress.shutdown().await;

        let stats = ingress.stats();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.written, 0);
    }

    #[tokio::test]
    async fn accept_after_shutdown_is_closed() {
        let ingress = Ingress::new(
            Arc::new(MemoryBroker::default()),
            &IngressConfig::default(),
            Duration::from_secs(5),
        );
        ingress.shutdown().await;
        let err = ingress
            .accept(&StreamId::from("s1"), br#"{"a":1}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, IngressError::Closed));
    }
}
