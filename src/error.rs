//! Error types shared across the service layer.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by an external collaborator (yt-dlp, caption host, LLM).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("provider call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
}

impl ProviderError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Error surfaced by resolvers and services to the HTTP layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Provider(ProviderError),
    #[error("storage failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(message) => Self::NotFound(message),
            other => Self::Provider(other),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
