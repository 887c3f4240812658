use std::future::Future;
use std::pin::Pin;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use relay_api::{ProcessedResult, StreamId};
use relay_engine::{DeliveryError, Denial, ResultSink, forward_all};

use super::{API_KEY_HEADER, ApiError, AppState, ClientAddr, STREAM_ID_HEADER, header};

// ═══════════════════════════════════════════════════════════════
//  WebSocket: /ws/{stream_id}
// ═══════════════════════════════════════════════════════════════

/// Browsers cannot set headers on a WebSocket handshake, so the same
/// names are accepted as query parameters.
#[derive(Deserialize, Default)]
pub(crate) struct WsAuthParams {
    #[serde(rename = "X-API-Key")]
    api_key: Option<String>,
    #[serde(rename = "X-Stream-ID")]
    stream_id: Option<String>,
}

pub(crate) async fn handle_ws(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    ClientAddr(client): ClientAddr,
    headers: HeaderMap,
    Query(params): Query<WsAuthParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let api_key = header(&headers, API_KEY_HEADER).or(params.api_key.as_deref());
    let declared = header(&headers, STREAM_ID_HEADER)
        .or(params.stream_id.as_deref())
        .filter(|s| !s.is_empty());

    let stream = StreamId::from(stream_id);
    let gate = state.engine.gate();
    gate.verify_credential(api_key, &client)?;
    let Some(declared) = declared else {
        return Err(gate.reject(Denial::Unauthorized, &client).into());
    };
    gate.check_ownership(&stream, Some(declared))?;
    gate.check_rate(&client)?;

    Ok(ws.on_upgrade(move |socket| ws_connection(socket, state, stream)))
}

async fn ws_connection(socket: WebSocket, state: AppState, stream: StreamId) {
    let (sender, receiver) = socket.split();

    // Stops on peer close, read error or process shutdown.
    let cancel = state.shutdown.child_token();
    let watcher = tokio::spawn(watch_peer(receiver, cancel.clone(), stream.clone()));

    tracing::info!(stream = %stream, "websocket streaming started");
    let handle = state.engine.egress().open(&stream);
    let mut sink = WsResultSink { sender };
    let summary = forward_all(handle, &mut sink, &cancel).await;

    cancel.cancel();
    let _ = sink.sender.close().await;
    if let Err(e) = watcher.await {
        tracing::warn!(stream = %stream, error = %e, "websocket watcher failed");
    }
    tracing::info!(
        stream = %stream,
        forwarded = summary.forwarded,
        end = ?summary.end,
        "websocket streaming finished"
    );
}

/// Drain the read half; incoming frames are ignored apart from close.
async fn watch_peer(mut receiver: SplitStream<WebSocket>, cancel: CancellationToken, stream: StreamId) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(stream = %stream, "client disconnected from websocket");
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(stream = %stream, error = %e, "websocket read failed");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    cancel.cancel();
}

struct WsResultSink {
    sender: SplitSink<WebSocket, Message>,
}

impl ResultSink for WsResultSink {
    fn push<'a>(
        &'a mut self,
        result: &'a ProcessedResult,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>> {
        Box::pin(async move {
            let text = serde_json::to_string(result).map_err(|e| DeliveryError::Push(e.to_string()))?;
            self.sender
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| DeliveryError::Push(e.to_string()))
        })
    }
}
