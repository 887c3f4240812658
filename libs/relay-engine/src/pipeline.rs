//! Egress pipelines: one background task per open, each with its own
//! consumer group, feeding a small bounded channel of results.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relay_api::{Broker, BrokerReader, ErrorKind, ProcessedResult, RawRecord, StreamId};

use crate::config::EgressConfig;

// ═══════════════════════════════════════════════════════════════
//  Egress
// ═══════════════════════════════════════════════════════════════

/// Factory for per-request pipelines over one shared broker.
pub struct Egress {
    broker: Arc<dyn Broker>,
    config: EgressConfig,
}

impl std::fmt::Debug for Egress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Egress").field("config", &self.config).finish()
    }
}

impl Egress {
    pub fn new(broker: Arc<dyn Broker>, config: EgressConfig) -> Self {
        Self { broker, config }
    }

    /// Start a pipeline for `stream` with a consumer group of its own.
    ///
    /// The returned handle yields results with sequence numbers 1, 2, 3...
    /// in broker order.
    pub fn open(&self, stream: &StreamId) -> PipelineHandle {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let cancel = CancellationToken::new();
        let group = format!(
            "{}-{}-{}",
            self.config.group_prefix,
            stream,
            uuid::Uuid::new_v4().simple()
        );

        tracing::debug!(stream = %stream, group = %group, "opening pipeline");

        let task = tokio::spawn(run_pipeline(
            Arc::clone(&self.broker),
            stream.clone(),
            group,
            self.config.start_from,
            tx,
            cancel.clone(),
        ));

        PipelineHandle {
            stream: stream.clone(),
            rx,
            cancel,
            task: Some(task),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  PipelineHandle
// ═══════════════════════════════════════════════════════════════

/// Receive side of one pipeline plus its cancellation.
///
/// Call [`PipelineHandle::shutdown`] to stop the task and wait until the
/// consumer is released. Dropping the handle only requests the stop.
pub struct PipelineHandle {
    stream: StreamId,
    rx: mpsc::Receiver<ProcessedResult>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("stream", &self.stream)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl PipelineHandle {
    /// Next result; `None` once the pipeline has stopped and the channel is
    /// empty.
    pub async fn recv(&mut self) -> Option<ProcessedResult> {
        self.rx.recv().await
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Cancel the pipeline and wait for its task to close the consumer.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(stream = %self.stream, error = %e, "pipeline task failed");
            }
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ═══════════════════════════════════════════════════════════════
//  Pipeline task
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    ReceiverGone,
    UpstreamClosed,
    ReadFailed,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::ReceiverGone => f.write_str("receiver gone"),
            StopReason::UpstreamClosed => f.write_str("upstream closed"),
            StopReason::ReadFailed => f.write_str("read failed"),
        }
    }
}

async fn run_pipeline(
    broker: Arc<dyn Broker>,
    stream: StreamId,
    group: String,
    start: relay_api::StartOffset,
    tx: mpsc::Sender<ProcessedResult>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(stream = %stream, "pipeline cancelled before consumer was bound");
            return;
        }
        r = broker.open_consumer(stream.topic(), &group, start) => r,
    };
    let mut reader = match opened {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(stream = %stream, group = %group, error = %e, "failed to open consumer");
            return;
        }
    };

    let (reason, sequence) = pump(reader.as_mut(), &stream, &tx, &cancel).await;

    reader.close().await;
    tracing::debug!(stream = %stream, group = %group, delivered = sequence, %reason, "pipeline stopped");
}

/// Read → transform → send until something stops the loop. Returns why, and
/// the last sequence number handed to the channel.
async fn pump(
    reader: &mut dyn BrokerReader,
    stream: &StreamId,
    tx: &mpsc::Sender<ProcessedResult>,
    cancel: &CancellationToken,
) -> (StopReason, u64) {
    let mut sequence = 0u64;
    loop {
        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (StopReason::Cancelled, sequence),
            r = reader.read_next() => r,
        };
        let record = match record {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::Closed => {
                tracing::debug!(stream = %stream, error = %e, "upstream closed");
                return (StopReason::UpstreamClosed, sequence);
            }
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "upstream read failed");
                return (StopReason::ReadFailed, sequence);
            }
        };

        let result = transform(sequence + 1, &record);
        tracing::debug!(stream = %stream, "processed {result}");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return (StopReason::Cancelled, sequence),
            sent = tx.send(result) => {
                if sent.is_err() {
                    return (StopReason::ReceiverGone, sequence);
                }
            }
        }
        sequence += 1;
    }
}

/// Tag one record with its sequence number and processing time.
pub fn transform(sequence: u64, record: &RawRecord) -> ProcessedResult {
    ProcessedResult {
        sequence,
        processed_at: Utc::now(),
        data: String::from_utf8_lossy(&record.payload).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    use relay_api::{BrokerError, StartOffset};
    use relay_broker_memory::MemoryBroker;

    use super::*;

    fn egress(broker: &MemoryBroker, start_from: StartOffset) -> Egress {
        Egress::new(
            Arc::new(broker.clone()),
            EgressConfig {
                start_from,
                ..EgressConfig::default()
            },
        )
    }

    #[test]
    fn transform_keeps_payload_text() {
        let record = RawRecord {
            payload: br#"{"a":1}"#.to_vec(),
            offset: 7,
        };
        let result = transform(3, &record);
        assert_eq!(result.sequence, 3);
        assert_eq!(result.data, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn results_are_numbered_in_broker_order() {
        let broker = MemoryBroker::default();
        for p in ["r1", "r2", "r3"] {
            broker.write("s", p.as_bytes().to_vec()).await.unwrap();
        }
        let mut handle = egress(&broker, StartOffset::Earliest).open(&StreamId::from("s"));

        for (seq, data) in [(1, "r1"), (2, "r2"), (3, "r3")] {
            let result = handle.recv().await.unwrap();
            assert_eq!(result.sequence, seq);
            assert_eq!(result.data, data);
        }
        handle.shutdown().await;
        assert_eq!(broker.open_readers(), 0);
    }

    #[tokio::test]
    async fn every_open_is_an_independent_consumer() {
        let broker = MemoryBroker::default();
        broker.write("s", b"r1".to_vec()).await.unwrap();
        let egress = egress(&broker, StartOffset::Earliest);

        let mut a = egress.open(&StreamId::from("s"));
        let mut b = egress.open(&StreamId::from("s"));
        assert_eq!(a.recv().await.unwrap().sequence, 1);
        assert_eq!(b.recv().await.unwrap().sequence, 1);
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn latest_start_skips_existing_records() {
        let broker = MemoryBroker::default();
        broker.write("s", b"old".to_vec()).await.unwrap();
        let mut handle = egress(&broker, StartOffset::Latest).open(&StreamId::from("s"));

        // Wait until the pipeline has bound its consumer.
        while broker.open_readers() == 0 {
            tokio::task::yield_now().await;
        }
        broker.write("s", b"new".to_vec()).await.unwrap();

        let result = handle.recv().await.unwrap();
        assert_eq!(result.sequence, 1);
        assert_eq!(result.data, "new");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn full_channel_blocks_without_dropping() {
        let broker = MemoryBroker::default();
        for i in 0..20 {
            broker.write("s", format!("r{i}").into_bytes()).await.unwrap();
        }
        let mut handle = egress(&broker, StartOffset::Earliest).open(&StreamId::from("s"));

        // Let the pipeline run ahead until it blocks on the full channel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..20u64 {
            let result = handle.recv().await.unwrap();
            assert_eq!(result.sequence, i + 1);
            assert_eq!(result.data, format!("r{i}"));
        }
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_a_pipeline_blocked_on_read() {
        let broker = MemoryBroker::default();
        let handle = egress(&broker, StartOffset::Earliest).open(&StreamId::from("idle"));
        while broker.open_readers() == 0 {
            tokio::task::yield_now().await;
        }
        handle.shutdown().await;
        assert_eq!(broker.open_readers(), 0);
    }

    #[tokio::test]
    async fn closed_topic_ends_the_channel() {
        let broker = MemoryBroker::default();
        let mut handle = egress(&broker, StartOffset::Earliest).open(&StreamId::from("s"));
        while broker.open_readers() == 0 {
            tokio::task::yield_now().await;
        }
        broker.close_topic("s");
        assert!(handle.recv().await.is_none());
        handle.shutdown().await;
        assert_eq!(broker.open_readers(), 0);
    }

    #[tokio::test]
    async fn dropped_handle_still_stops_the_task() {
        let broker = MemoryBroker::default();
        let handle = egress(&broker, StartOffset::Earliest).open(&StreamId::from("s"));
        while broker.open_readers() == 0 {
            tokio::task::yield_now().await;
        }
        drop(handle);
        while broker.open_readers() != 0 {
            tokio::task::yield_now().await;
        }
    }

    struct FailingReader;

    impl BrokerReader for FailingReader {
        fn read_next(
            &mut self,
        ) -> Pin<Box<dyn Future<Output = Result<RawRecord, BrokerError>> + Send + '_>> {
            Box::pin(async { Err(BrokerError::io("connection reset")) })
        }

        fn close(self: Box<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn pump_tells_closed_topic_from_read_failure() {
        let broker = MemoryBroker::default();
        let stream = StreamId::from("s");
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        broker.write("s", b"{}".to_vec()).await.unwrap();
        let mut reader = broker
            .open_consumer("s", "g", StartOffset::Earliest)
            .await
            .unwrap();
        let first = reader.read_next().await.unwrap();
        assert_eq!(transform(1, &first).data, "{}");
        broker.close_topic("s");
        let (reason, delivered) = pump(reader.as_mut(), &stream, &tx, &cancel).await;
        assert_eq!(reason, StopReason::UpstreamClosed);
        assert_eq!(delivered, 0);
        reader.close().await;

        let (reason, _) = pump(&mut FailingReader, &stream, &tx, &cancel).await;
        assert_eq!(reason, StopReason::ReadFailed);
    }
}
