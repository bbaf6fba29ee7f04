/// Unified error types for Nexus Deploy
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the platform
#[derive(Error, Debug)]
pub enum NexusError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Key-value store errors
    #[error("KV store error: {0}")]
    Kv(#[from] redis::RedisError),

    /// Authentication errors (missing/invalid/revoked bearer)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authorization errors
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Validation errors (malformed input, missing fields)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (invalid state transition, duplicate resource)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Quota errors (plan limits reached)
    #[error("{0}")]
    QuotaExceeded(String),

    /// Rate limiting
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Failed precondition (e.g. no successful build to deploy)
    #[error("Precondition failed: {0}")]
    FailedPrecondition(String),

    /// Peer service / external dependency failures
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// Container runtime errors
    #[error("Container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Crypto failures
    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    /// Deadline exceeded on an outbound call
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Standard error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub correlation_id: String,
    pub code: String,
}

impl NexusError {
    /// Machine code for the error body
    pub fn code(&self) -> &'static str {
        match self {
            NexusError::Validation(_) => "INVALID_ARGUMENT",
            NexusError::Authentication(_) => "UNAUTHENTICATED",
            NexusError::Authorization(_) => "PERMISSION_DENIED",
            NexusError::NotFound(_) => "NOT_FOUND",
            NexusError::Conflict(_) => "CONFLICT",
            NexusError::QuotaExceeded(_) | NexusError::RateLimitExceeded => "RESOURCE_EXHAUSTED",
            NexusError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            NexusError::Dependency(_) => "UNAVAILABLE",
            NexusError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// HTTP status mapping
    pub fn status(&self) -> StatusCode {
        match self {
            NexusError::Validation(_) => StatusCode::BAD_REQUEST,
            NexusError::Authentication(_) => StatusCode::UNAUTHORIZED,
            NexusError::Authorization(_) => StatusCode::FORBIDDEN,
            NexusError::NotFound(_) => StatusCode::NOT_FOUND,
            NexusError::Conflict(_) => StatusCode::CONFLICT,
            NexusError::QuotaExceeded(_) | NexusError::RateLimitExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            NexusError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            NexusError::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
            NexusError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NexusError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Don't leak internals for 5xx
        let message = match &self {
            NexusError::Database(_)
            | NexusError::Kv(_)
            | NexusError::Io(_)
            | NexusError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message,
            correlation_id: String::new(),
            code: self.code().to_string(),
        };

        // The correlation-id middleware finds this extension and rewrites
        // the body with the request's id filled in.
        let mut response = (status, Json(body.clone())).into_response();
        response.extensions_mut().insert(body);
        response
    }
}

/// Result type alias for platform operations
pub type NexusResult<T> = Result<T, NexusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            NexusError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            NexusError::Authentication("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            NexusError::Authorization("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            NexusError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            NexusError::Conflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            NexusError::QuotaExceeded("x".into()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            NexusError::FailedPrecondition("x".into()).status(),
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            NexusError::Dependency("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            NexusError::DeadlineExceeded("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            NexusError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let err = NexusError::Internal("secret detail".into());
        assert_eq!(err.code(), "INTERNAL_ERROR");
        // The response body masks the message; code covers mapping only.
    }
}
