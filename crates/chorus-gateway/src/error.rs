//! Dispatch error taxonomy and wire mapping.

use thiserror::Error;

use chorus_core::status;
use chorus_sessions::SessionError;
use chorus_storage::StoreError;

/// Errors a command handler can surface to the requesting client.
///
/// The wire only ever sees the status code and a short public message;
/// internal detail is logged server-side before the error leaves the
/// dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed or missing arguments.
    #[error("{0}")]
    BadRequest(String),

    /// Socket unauthenticated or token verification failed.
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but the connection's role is insufficient.
    #[error("{0}")]
    Forbidden(String),

    /// Unknown command or no such session.
    #[error("{0}")]
    NotFound(String),

    /// Internal or external-dependency failure. The payload is the
    /// server-side detail, never sent to the client.
    #[error("{0}")]
    Internal(String),
}

impl DispatchError {
    /// The wire status code for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => status::BAD_REQUEST,
            Self::Unauthorized(_) => status::UNAUTHORIZED,
            Self::Forbidden(_) => status::FORBIDDEN,
            Self::NotFound(_) => status::NOT_FOUND,
            Self::Internal(_) => status::INTERNAL,
        }
    }

    /// The message sent to the client. Internal detail is replaced with
    /// a generic string.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<SessionError> for DispatchError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(key) => Self::NotFound(format!("no such session: {key}")),
            SessionError::Terminated(key) => {
                Self::NotFound(format!("session terminated: {key}"))
            }
            SessionError::Store(inner) => Self::Internal(inner.to_string()),
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidUpdate(msg) => Self::BadRequest(msg),
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::SessionTerminated(key) => {
                Self::NotFound(format!("session terminated: {key}"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(DispatchError::BadRequest(String::new()).status_code(), 400);
        assert_eq!(DispatchError::Unauthorized(String::new()).status_code(), 401);
        assert_eq!(DispatchError::Forbidden(String::new()).status_code(), 403);
        assert_eq!(DispatchError::NotFound(String::new()).status_code(), 404);
        assert_eq!(DispatchError::Internal(String::new()).status_code(), 500);
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let e = DispatchError::Internal("mongo timeout at 10.0.0.3".to_string());
        assert_eq!(e.public_message(), "internal error");

        let e = DispatchError::Unauthorized("invalid token".to_string());
        assert_eq!(e.public_message(), "invalid token");
    }

    #[test]
    fn test_terminated_session_maps_to_not_found() {
        let e: DispatchError = SessionError::Terminated("d1__s".into()).into();
        assert_eq!(e.status_code(), 404);
    }
}
