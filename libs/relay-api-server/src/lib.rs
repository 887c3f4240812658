mod client;
mod error;
mod http;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use relay_engine::Engine;

use client::ClientAddr;

pub use error::ApiError;

/// Header carrying the shared API key.
pub const API_KEY_HEADER: &str = "X-API-Key";
/// Header carrying the stream id the client claims to own.
pub const STREAM_ID_HEADER: &str = "X-Stream-ID";

#[derive(Clone)]
pub(crate) struct AppState {
    engine: Arc<Engine>,
    /// Cancelled on process shutdown; open WebSocket streams stop with it.
    shutdown: CancellationToken,
}

/// Build the HTTP + WebSocket router over a bootstrapped engine.
pub fn router(engine: Arc<Engine>, shutdown: CancellationToken) -> Router {
    let state = AppState { engine, shutdown };

    Router::new()
        .route("/", get(http::handle_root))
        .route("/stream/start", post(http::handle_start))
        .route("/stream/{stream_id}/send", post(http::handle_send))
        .route("/stream/{stream_id}/results", get(http::handle_results))
        .route("/ws/{stream_id}", get(ws::handle_ws))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let app = router(engine, shutdown.clone());

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))
}

/// Bind `0.0.0.0:{port}` and serve until `shutdown` is cancelled.
pub async fn run(port: u16, engine: Arc<Engine>, shutdown: CancellationToken) -> Result<(), String> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind api :{port}: {e}"))?;

    tracing::info!(port, "API server listening");
    serve(listener, engine, shutdown).await
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

pub(crate) fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}
