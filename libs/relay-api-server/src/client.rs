use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;

use super::AppState;

/// Address the rate limiter keys on.
///
/// The socket peer IP when known, otherwise the first `X-Forwarded-For`
/// entry, otherwise `"unknown"`. With `rate_limit.trust_forwarded_for` the
/// forwarded address wins over the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientAddr(pub String);

impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let forwarded = forwarded_for(&parts.headers);
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let trust_forwarded = state.engine.config().rate_limit.trust_forwarded_for;
        let addr = if trust_forwarded {
            forwarded.or(peer)
        } else {
            peer.or(forwarded)
        };
        Ok(ClientAddr(addr.unwrap_or_else(|| "unknown".to_string())))
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
