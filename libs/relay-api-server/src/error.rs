use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use relay_engine::{DeliveryError, Denial, IngressError};

/// Every way a request can fail, with its HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized: invalid or missing API key")]
    Unauthorized,

    #[error("Forbidden: Access to this stream is restricted")]
    Forbidden,

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Invalid or missing JSON data")]
    BadRequest(String),

    #[error("No data processed within timeout")]
    GatewayTimeout,

    #[error("Service unavailable")]
    Unavailable(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::BadRequest(detail) => tracing::debug!(%detail, "bad request body"),
            ApiError::Unavailable(detail) => tracing::warn!(%detail, "service unavailable"),
            _ => {}
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<Denial> for ApiError {
    fn from(denial: Denial) -> Self {
        match denial {
            Denial::Unauthorized => ApiError::Unauthorized,
            Denial::Forbidden => ApiError::Forbidden,
            Denial::TooManyRequests => ApiError::TooManyRequests,
        }
    }
}

impl From<IngressError> for ApiError {
    fn from(e: IngressError) -> Self {
        match e {
            IngressError::BadRequest(detail) => ApiError::BadRequest(detail),
            IngressError::Closed => ApiError::Unavailable("ingress is shut down".into()),
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Timeout(_) => ApiError::GatewayTimeout,
            DeliveryError::Push(detail) => ApiError::Unavailable(detail),
        }
    }
}
