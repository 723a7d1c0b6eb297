//! API request/response types and error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::domain::llm::ProviderResponse;
use crate::domain::DomainError;
use crate::infrastructure::observability::MetricsSnapshot;

/// Successful lookup response
#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    /// "exact", "semantic" or "provider"
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub response: ProviderResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateAccepted {
    pub tag: String,
    pub subscribers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThresholdRequest {
    pub threshold: f32,
}

/// Cache effectiveness report served by the metrics endpoint
#[derive(Debug, Serialize)]
pub struct CacheMetricsResponse {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub exact_entries: usize,
    pub semantic_entries: usize,
    pub negative_entries: usize,
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorType {
    InvalidRequestError,
    UpstreamError,
    ServerError,
    ServiceUnavailableError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: ApiErrorType,
    /// Clients may retry these errors after a short delay
    pub retryable: bool,
}

/// API error with status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ApiErrorResponse,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        error_type: ApiErrorType,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            status,
            response: ApiErrorResponse {
                error: ApiErrorDetail {
                    message: message.into(),
                    error_type,
                    retryable,
                },
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ApiErrorType::InvalidRequestError,
            message,
            false,
        )
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        match &error {
            DomainError::Configuration { .. } => Self::new(
                StatusCode::BAD_REQUEST,
                ApiErrorType::InvalidRequestError,
                error.to_string(),
                false,
            ),
            DomainError::ProviderTransient { .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ApiErrorType::ServiceUnavailableError,
                error.to_string(),
                true,
            ),
            DomainError::ProviderTerminal { .. } => Self::new(
                StatusCode::BAD_GATEWAY,
                ApiErrorType::UpstreamError,
                error.to_string(),
                false,
            ),
            DomainError::Cache { .. } | DomainError::Internal { .. } => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorType::ServerError,
                error.to_string(),
                false,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}
