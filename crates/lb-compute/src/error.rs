//! Compute API error types and HTTP status handling.
//!
//! Every call against the cloud compute API either succeeds or fails with a
//! [`ComputeError`]. HTTP failures keep the raw status code and the message
//! returned by the API so that callers can recognise specific conditions
//! (not found, address in use) without parsing strings twice.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// HTTP status codes the compute API is known to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpStatus {
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    PreconditionFailed,
    TooManyRequests,
    InternalServerError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    Other(u16),
}

impl HttpStatus {
    /// Creates an HttpStatus from a raw status code.
    pub fn from_code(code: u16) -> Self {
        match code {
            400 => HttpStatus::BadRequest,
            403 => HttpStatus::Forbidden,
            404 => HttpStatus::NotFound,
            409 => HttpStatus::Conflict,
            412 => HttpStatus::PreconditionFailed,
            429 => HttpStatus::TooManyRequests,
            500 => HttpStatus::InternalServerError,
            502 => HttpStatus::BadGateway,
            503 => HttpStatus::ServiceUnavailable,
            504 => HttpStatus::GatewayTimeout,
            other => HttpStatus::Other(other),
        }
    }

    /// Returns the raw status code.
    pub fn code(&self) -> u16 {
        match self {
            HttpStatus::BadRequest => 400,
            HttpStatus::Forbidden => 403,
            HttpStatus::NotFound => 404,
            HttpStatus::Conflict => 409,
            HttpStatus::PreconditionFailed => 412,
            HttpStatus::TooManyRequests => 429,
            HttpStatus::InternalServerError => 500,
            HttpStatus::BadGateway => 502,
            HttpStatus::ServiceUnavailable => 503,
            HttpStatus::GatewayTimeout => 504,
            HttpStatus::Other(code) => *code,
        }
    }

    /// Returns true for 5xx codes.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.code())
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Error type for compute API operations.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    /// The API answered with a non-success HTTP status.
    #[error("googleapi: Error {status}: {message}")]
    Http { status: HttpStatus, message: String },

    /// The call did not complete within the per-call deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The resource key is not valid for the requested surface.
    #[error("Invalid resource key: {message}")]
    InvalidKey { message: String },

    /// A resource URL could not be parsed.
    #[error("Invalid resource URL {url:?}: {message}")]
    InvalidResourceUrl { url: String, message: String },

    /// An object could not be converted between API representations.
    #[error("Failed to convert {kind}: {message}")]
    Serialization { kind: String, message: String },

    /// No API surface is registered for the version/scope pair.
    #[error("No {version} {scope} surface for {resource}")]
    Unsupported {
        resource: String,
        version: String,
        scope: String,
    },
}

impl ComputeError {
    /// Creates an HTTP error from a raw status code and message.
    pub fn http(code: u16, message: impl Into<String>) -> Self {
        ComputeError::Http {
            status: HttpStatus::from_code(code),
            message: message.into(),
        }
    }

    /// Creates a 404 error for the named item.
    pub fn not_found(item: impl AsRef<str>) -> Self {
        ComputeError::http(
            404,
            format!("The resource '{}' was not found", item.as_ref()),
        )
    }

    /// Creates a 409 error for an item that already exists.
    pub fn already_exists(item: impl AsRef<str>) -> Self {
        ComputeError::http(
            409,
            format!("The resource '{}' already exists", item.as_ref()),
        )
    }

    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        ComputeError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Creates an invalid key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        ComputeError::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates an invalid resource URL error.
    pub fn invalid_resource_url(url: impl Into<String>, message: impl Into<String>) -> Self {
        ComputeError::InvalidResourceUrl {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(kind: impl Into<String>, message: impl fmt::Display) -> Self {
        ComputeError::Serialization {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    /// Returns the HTTP status code if this is an HTTP error.
    pub fn http_code(&self) -> Option<u16> {
        match self {
            ComputeError::Http { status, .. } => Some(status.code()),
            _ => None,
        }
    }

    /// Returns the message carried by an HTTP error.
    pub fn http_message(&self) -> Option<&str> {
        match self {
            ComputeError::Http { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Returns true if the error is an HTTP error with the given code.
    pub fn is_http_code(&self, code: u16) -> bool {
        self.http_code() == Some(code)
    }

    /// Returns true if the API reported the resource as missing.
    pub fn is_not_found(&self) -> bool {
        self.is_http_code(404)
    }

    /// Returns true if this error is likely transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            ComputeError::Timeout { .. } => true,
            ComputeError::Http { status, .. } => {
                status.is_server_error() || *status == HttpStatus::TooManyRequests
            }
            _ => false,
        }
    }
}

/// Result type for compute API operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Maps a not-found error to `Ok(None)`.
pub fn ignore_not_found<T>(result: ComputeResult<T>) -> ComputeResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_code() {
        assert_eq!(HttpStatus::from_code(404), HttpStatus::NotFound);
        assert_eq!(HttpStatus::from_code(409), HttpStatus::Conflict);
        assert_eq!(HttpStatus::from_code(418), HttpStatus::Other(418));
        assert_eq!(HttpStatus::Other(418).code(), 418);
    }

    #[test]
    fn test_error_display() {
        let err = ComputeError::http(400, "bad things");
        assert_eq!(err.to_string(), "googleapi: Error 400: bad things");
    }

    #[test]
    fn test_not_found() {
        let err = ComputeError::not_found("fr-1");
        assert!(err.is_not_found());
        assert_eq!(err.http_code(), Some(404));
        assert!(!ComputeError::already_exists("fr-1").is_not_found());
    }

    #[test]
    fn test_retryable() {
        assert!(ComputeError::http(503, "unavailable").is_retryable());
        assert!(ComputeError::http(429, "slow down").is_retryable());
        assert!(ComputeError::timeout("insert", Duration::from_secs(1)).is_retryable());
        assert!(!ComputeError::http(400, "bad").is_retryable());
        assert!(!ComputeError::invalid_key("no region").is_retryable());
    }

    #[test]
    fn test_ignore_not_found() {
        let missing: ComputeResult<u32> = Err(ComputeError::not_found("x"));
        assert!(matches!(ignore_not_found(missing), Ok(None)));

        let found: ComputeResult<u32> = Ok(7);
        assert!(matches!(ignore_not_found(found), Ok(Some(7))));

        let failed: ComputeResult<u32> = Err(ComputeError::http(500, "boom"));
        assert!(ignore_not_found(failed).is_err());
    }
}
