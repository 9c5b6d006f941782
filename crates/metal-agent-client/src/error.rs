//! Error types for the control-plane client.

use thiserror::Error;

/// Errors returned by a [`RemoteControlClient`](crate::RemoteControlClient).
///
/// Transport-level detail is flattened into strings so callers branch on the
/// kind of failure, never on the HTTP library's types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The node, port, target or association does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource is locked or was concurrently modified.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request was rejected as invalid or unsupported.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Credentials were missing or rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The control plane could not be reached or is overloaded.
    #[error("control plane unavailable: {0}")]
    Unavailable(String),

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Classify an HTTP error status.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 | 406 | 422 => Self::BadRequest(message),
            401 | 403 => Self::Unauthorized(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            500..=599 => Self::Unavailable(message),
            _ => Self::InvalidResponse(format!("unexpected status {status}: {message}")),
        }
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }

    /// Check if this error means the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Get the HTTP status code for this error.
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Unavailable(_) => 503,
            Self::InvalidResponse(_) => 502,
        }
    }
}

/// A specialized Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(ClientError::from_status(404, "x"), ClientError::NotFound(_)));
        assert!(matches!(ClientError::from_status(409, "x"), ClientError::Conflict(_)));
        assert!(matches!(ClientError::from_status(400, "x"), ClientError::BadRequest(_)));
        assert!(matches!(ClientError::from_status(403, "x"), ClientError::Unauthorized(_)));
        assert!(matches!(ClientError::from_status(503, "x"), ClientError::Unavailable(_)));
        assert!(matches!(
            ClientError::from_status(302, "x"),
            ClientError::InvalidResponse(_)
        ));
    }

    #[test]
    fn retriable_kinds() {
        assert!(ClientError::Conflict("locked".into()).is_retriable());
        assert!(ClientError::Unavailable("down".into()).is_retriable());
        assert!(!ClientError::BadRequest("nope".into()).is_retriable());
        assert!(!ClientError::NotFound("gone".into()).is_retriable());
    }

    #[test]
    fn status_code_roundtrip() {
        for status in [400, 401, 404, 409, 503] {
            assert_eq!(ClientError::from_status(status, "m").http_status_code(), status);
        }
    }
}
