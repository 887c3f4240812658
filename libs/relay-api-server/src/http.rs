use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Serialize;

use relay_api::{ProcessedResult, StreamId};
use relay_engine::first_result;

use super::{API_KEY_HEADER, ApiError, AppState, ClientAddr, STREAM_ID_HEADER, header};

// ═══════════════════════════════════════════════════════════════
//  GET /
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_root() -> &'static str {
    "Welcome to the real-time data streaming API!"
}

// ═══════════════════════════════════════════════════════════════
//  POST /stream/start
// ═══════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct StartResponse {
    stream_id: StreamId,
}

pub(crate) async fn handle_start(
    State(state): State<AppState>,
    ClientAddr(client): ClientAddr,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .gate()
        .authorize(header(&headers, API_KEY_HEADER), &client)?;

    let stream_id = state.engine.start_stream();
    Ok((StatusCode::CREATED, Json(StartResponse { stream_id })))
}

// ═══════════════════════════════════════════════════════════════
//  POST /stream/{stream_id}/send
// ═══════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct AcceptedResponse {
    status: &'static str,
}

pub(crate) async fn handle_send(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    ClientAddr(client): ClientAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let stream = StreamId::from(stream_id);
    admit(&state, &stream, &headers, &client)?;

    state.engine.ingress().accept(&stream, &body).await?;
    tracing::debug!(stream = %stream, bytes = body.len(), "payload accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "data accepted",
        }),
    ))
}

// ═══════════════════════════════════════════════════════════════
//  GET /stream/{stream_id}/results
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_results(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    ClientAddr(client): ClientAddr,
    headers: HeaderMap,
) -> Result<Json<ProcessedResult>, ApiError> {
    let stream = StreamId::from(stream_id);
    admit(&state, &stream, &headers, &client)?;

    let handle = state.engine.egress().open(&stream);
    let wait = state.engine.config().egress.result_timeout();
    let result = first_result(handle, wait).await?;
    Ok(Json(result))
}

/// Ownership first, so a mismatch is 403 whatever the key; then key and rate.
fn admit(state: &AppState, stream: &StreamId, headers: &HeaderMap, client: &str) -> Result<(), ApiError> {
    let gate = state.engine.gate();
    gate.check_ownership(stream, header(headers, STREAM_ID_HEADER))?;
    gate.authorize(header(headers, API_KEY_HEADER), client)?;
    Ok(())
}
