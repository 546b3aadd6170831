use std::io;

use serde::Serialize;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("external service failure: {0}")]
    ExternalService(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidParameter,
    NotFound,
    ExternalServiceFailure,
    StorageFailure,
    Timeout,
    Internal,
}

/// Caller-facing error object returned in place of a feature collection.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub status: u16,
    pub message: String,
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AppError::InvalidParameter(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::ExternalService(_) | AppError::Http(_) => ErrorKind::ExternalServiceFailure,
            AppError::Storage(_) | AppError::Database(_) => ErrorKind::StorageFailure,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Io(_) | AppError::Json(_) | AppError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let kind = self.kind();
        let (status, message) = match kind {
            ErrorKind::InvalidParameter | ErrorKind::NotFound => {
                let status = if kind == ErrorKind::NotFound { 404 } else { 400 };
                (status, self.to_string())
            }
            ErrorKind::ExternalServiceFailure => (502, "external service unavailable".into()),
            ErrorKind::StorageFailure => (500, "storage failure".into()),
            ErrorKind::Timeout => (504, "operation timed out".into()),
            ErrorKind::Internal => (500, "internal error".into()),
        };
        ErrorPayload {
            kind,
            status,
            message,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidParameter | ErrorKind::NotFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_hide_details() {
        let err = AppError::Database(rusqlite::Error::InvalidQuery);
        let payload = err.payload();
        assert_eq!(payload.kind, ErrorKind::StorageFailure);
        assert_eq!(payload.status, 500);
        assert_eq!(payload.message, "storage failure");
        assert!(!err.is_client_error());
    }

    #[test]
    fn invalid_parameter_is_reported_verbatim() {
        let err = AppError::invalid("k must be positive");
        let payload = err.payload();
        assert_eq!(payload.status, 400);
        assert!(payload.message.contains("k must be positive"));
        assert!(err.is_client_error());
    }
}
