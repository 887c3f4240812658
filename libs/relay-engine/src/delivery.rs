//! Delivery adapters over a [`PipelineHandle`]. Both shut the pipeline down
//! before returning.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_api::ProcessedResult;

use crate::pipeline::PipelineHandle;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("No data processed within timeout")]
    Timeout(Duration),

    #[error("push failed: {0}")]
    Push(String),
}

/// Outbound side of a streaming delivery (e.g. a WebSocket write half).
pub trait ResultSink: Send {
    fn push<'a>(
        &'a mut self,
        result: &'a ProcessedResult,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>>;
}

/// Why [`forward_all`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The pipeline stopped and every result was forwarded.
    Exhausted,
    /// A push to the sink failed.
    SinkFailed,
    /// The caller cancelled.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub forwarded: u64,
}

/// Wait at most `wait` for the first result.
///
/// A pipeline that stops before producing anything is reported as a
/// timeout too.
pub async fn first_result(
    mut handle: PipelineHandle,
    wait: Duration,
) -> Result<ProcessedResult, DeliveryError> {
    let outcome = tokio::time::timeout(wait, handle.recv()).await;
    let stream = handle.stream().clone();
    handle.shutdown().await;

    match outcome {
        Ok(Some(result)) => Ok(result),
        Ok(None) => {
            tracing::debug!(stream = %stream, "pipeline ended before the first result");
            Err(DeliveryError::Timeout(wait))
        }
        Err(_) => {
            tracing::debug!(stream = %stream, wait_ms = wait.as_millis() as u64, "no result within bounded wait");
            Err(DeliveryError::Timeout(wait))
        }
    }
}

/// Forward every result, in order, until the pipeline stops, the sink fails
/// or `cancel` fires.
pub async fn forward_all<S>(
    mut handle: PipelineHandle,
    sink: &mut S,
    cancel: &CancellationToken,
) -> StreamSummary
where
    S: ResultSink + ?Sized,
{
    let mut forwarded = 0u64;
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            next = handle.recv() => next,
        };
        let Some(result) = next else {
            break StreamEnd::Exhausted;
        };

        let pushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            pushed = sink.push(&result) => pushed,
        };
        if let Err(e) = pushed {
            tracing::debug!(stream = %handle.stream(), error = %e, "result push failed");
            break StreamEnd::SinkFailed;
        }
        forwarded += 1;
    };

    tracing::debug!(stream = %handle.stream(), forwarded, end = ?end, "streaming delivery finished");
    handle.shutdown().await;
    StreamSummary { end, forwarded }
}
