use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{service} unavailable ({status:?}): {message}")]
    TransientUpstream {
        service: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("{service} rejected request ({status:?}): {message}")]
    PermanentUpstream {
        service: &'static str,
        status: Option<u16>,
        message: String,
    },
    #[error("malformed cache record: {0}")]
    CacheCorruption(String),
    #[error("failed to load reference dataset: {0}")]
    ReferenceLoad(String),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    /// Classifies a provider HTTP status. 429 counts as transient alongside 5xx.
    pub fn from_status(service: &'static str, status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status >= 500 {
            AppError::TransientUpstream {
                service,
                status: Some(status),
                message,
            }
        } else {
            AppError::PermanentUpstream {
                service,
                status: Some(status),
                message,
            }
        }
    }

    pub fn from_reqwest(service: &'static str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(service, status.as_u16(), err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            AppError::TransientUpstream {
                service,
                status: None,
                message: err.to_string(),
            }
        } else {
            AppError::PermanentUpstream {
                service,
                status: None,
                message: err.to_string(),
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::TransientUpstream { .. })
    }

    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            AppError::TransientUpstream { status, .. }
            | AppError::PermanentUpstream { status, .. } => *status,
            _ => None,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::TransientUpstream { status, .. }
            | AppError::PermanentUpstream { status, .. } => status.unwrap_or(502),
            AppError::ReferenceLoad(_) => 502,
            _ => 500,
        }
    }
}
