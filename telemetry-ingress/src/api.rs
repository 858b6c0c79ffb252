use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct IngressResponse {
    pub accepted: usize,
    pub rate_limited: usize,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngressError {
    #[error("request holds no telemetry")]
    EmptyBatch,
    #[error("device authentication failed")]
    Unauthorized,
    #[error("device identity service unavailable")]
    AuthUnavailable,
    #[error("rate limited")]
    RateLimited,
    #[error("maximum payload size exceeded")]
    PayloadTooLarge,
    #[error("transient error, please retry")]
    BufferUnavailable,
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        match self {
            IngressError::EmptyBatch => (StatusCode::BAD_REQUEST, self.to_string()),

            IngressError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),

            IngressError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),

            IngressError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),

            IngressError::AuthUnavailable | IngressError::BufferUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        }
        .into_response()
    }
}
