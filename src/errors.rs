use axum::http::{HeaderMap, HeaderValue};
use axum::response::IntoResponse;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::pipeline::{InvalidTransition, RunState};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Db(sqlx::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found")]
    NotFound,
    #[error("Rate limited by external provider")]
    RateLimited,
    #[error("External error: {0}")]
    External(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::RateLimited => {
                let mut headers = HeaderMap::new();
                headers.insert("Retry-After", HeaderValue::from_static("60"));
                (StatusCode::TOO_MANY_REQUESTS, headers, "Rate limited").into_response()
            }
            AppError::External(msg) => (StatusCode::BAD_GATEWAY, msg).into_response(),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg).into_response(),
            AppError::Db(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(value: sqlx::Error) -> Self {
        AppError::Db(value)
    }
}

impl From<String> for AppError {
    fn from(value: String) -> Self {
        AppError::Validation(value)
    }
}

impl From<LlmError> for AppError {
    fn from(value: LlmError) -> Self {
        match value {
            LlmError::RateLimited => AppError::RateLimited,
            other => AppError::External(other.to_string()),
        }
    }
}

impl From<ResearchError> for AppError {
    fn from(value: ResearchError) -> Self {
        match value {
            ResearchError::ConfigurationError(msg) => AppError::Validation(msg),
            other => AppError::External(other.to_string()),
        }
    }
}

impl From<SearchError> for AppError {
    fn from(value: SearchError) -> Self {
        match value {
            SearchError::RateLimited => AppError::RateLimited,
            other => AppError::External(other.to_string()),
        }
    }
}

/// Errors raised by hosted LLM providers
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,
    #[error("LLM provider rate limited the request")]
    RateLimited,
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("LLM API error (status {status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::RateLimited | LlmError::NetworkError(_) => true,
            LlmError::ApiError { status, .. } => *status >= 500,
            LlmError::InvalidResponse(_) => false,
        }
    }
}

/// Errors raised by the search-retrieval provider
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SearchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("search request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("search API rejected credentials")]
    Unauthorized,
    #[error("bad response (status {status}): {message}")]
    BadResponse { status: u16, message: String },
    #[error("parse error: {0}")]
    Parse(String),
}

impl SearchError {
    /// Transient faults may clear up by the next iteration; the rest will not.
    pub fn is_transient(&self) -> bool {
        match self {
            SearchError::Network(_) | SearchError::Timeout | SearchError::RateLimited => true,
            SearchError::BadResponse { status, .. } => *status >= 500,
            SearchError::Unauthorized | SearchError::Parse(_) => false,
        }
    }
}

/// Failure taxonomy recorded against a pipeline run.
///
/// None of these abort a run once it has started; they are collected as
/// diagnostics and returned next to the topics.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResearchError {
    #[error("retrieval failed for '{query}': {message}")]
    TransientRetrievalFailure {
        query: String,
        message: String,
        transient: bool,
    },
    #[error("LLM call failed during {stage}: {message}")]
    LlmCallFailure { stage: String, message: String },
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("illegal run state transition {from} -> {to}")]
    InvalidState { from: RunState, to: RunState },
}

impl From<InvalidTransition> for ResearchError {
    fn from(value: InvalidTransition) -> Self {
        ResearchError::InvalidState {
            from: value.from,
            to: value.to,
        }
    }
}

impl ResearchError {
    pub fn retrieval(query: &str, err: &SearchError) -> Self {
        ResearchError::TransientRetrievalFailure {
            query: query.to_string(),
            message: err.to_string(),
            transient: err.is_transient(),
        }
    }

    pub fn llm(stage: impl Into<String>, err: &LlmError) -> Self {
        ResearchError::LlmCallFailure {
            stage: stage.into(),
            message: err.to_string(),
        }
    }
}
