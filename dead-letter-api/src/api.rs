use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use telemetry_common::deadletter::{DeadLetterError, DeadLetterFilter, PageRequest};
use telemetry_common::validation::{ErrorCategory, SchemaSuggestion};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Most ids accepted by one reprocess or delete call.
pub const MAX_IDS_PER_REQUEST: usize = 500;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("deleting dead letters requires an admin token")]
    Forbidden,
    #[error("dead letter {0} not found")]
    NotFound(Uuid),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] DeadLetterError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("dead-letter request failed: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Query string of `GET /dead-letters`.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub device_id: Option<String>,
    pub category: Option<ErrorCategory>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub reprocessed: Option<bool>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListParams {
    pub fn into_query(self) -> Result<(DeadLetterFilter, PageRequest), ApiError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(ApiError::BadRequest("from must not be after to".to_owned()));
            }
        }

        let filter = DeadLetterFilter {
            device_id: self.device_id,
            category: self.category,
            from: self.from,
            to: self.to,
            reprocessed: self.reprocessed,
        };
        Ok((filter, PageRequest::new(self.page, self.page_size)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<Uuid>,
}

impl IdsRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.ids.len() > MAX_IDS_PER_REQUEST {
            return Err(ApiError::BadRequest(format!(
                "at most {} ids per request",
                MAX_IDS_PER_REQUEST
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuggestionsResponse {
    pub id: Uuid,
    pub suggestions: Vec<SchemaSuggestion>,
}
