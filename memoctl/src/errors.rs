use crate::analysis::AnalysisError;
use crate::db::errors::DbError;
use crate::quota::QuotaError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided or not valid
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// The key pool is empty or too small for the request
    #[error(transparent)]
    Quota(QuotaError),

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<QuotaError> for Error {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Store(db) => Error::Database(db),
            other => Error::Quota(other),
        }
    }
}

impl From<AnalysisError> for Error {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Quota(quota) => quota.into(),
            AnalysisError::Catalog(db) => Error::Database(db),
            other => Error::Internal {
                operation: other.to_string(),
            },
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Quota(quota) => match quota {
                QuotaError::NoCredentialsAvailable => StatusCode::SERVICE_UNAVAILABLE,
                QuotaError::InsufficientQuota { .. } => StatusCode::TOO_MANY_REQUESTS,
                QuotaError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
            Error::Quota(QuotaError::Store(_)) => "Database error occurred".to_string(),
            // Quota errors carry no secrets, only counts.
            Error::Quota(quota) => quota.to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { .. } => "Resource already exists".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) | Error::Quota(QuotaError::Store(_)) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::Quota(_) => {
                tracing::warn!("Quota error: {}", self);
            }
            Error::Unauthenticated { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        (self.status_code(), self.user_message()).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_map_to_client_visible_statuses() {
        let empty: Error = AnalysisError::Quota(QuotaError::NoCredentialsAvailable).into();
        assert_eq!(empty.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let short: Error = QuotaError::InsufficientQuota { required: 3, remaining: 1 }.into();
        assert_eq!(short.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(short.user_message(), "Insufficient API quota: 3 calls required, 1 remaining");

        let store: Error = QuotaError::Store(DbError::NotFound).into();
        assert!(matches!(store, Error::Database(DbError::NotFound)));
    }

    #[test]
    fn internal_details_are_hidden() {
        let err: Error = AnalysisError::ArtifactPersistFailure("disk full at /srv/uploads".into()).into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), "Internal server error");
    }
}
