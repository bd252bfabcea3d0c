use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for the session subsystem.
///
/// The variants split into two families that background code treats very
/// differently: transient failures (`Network`), which are absorbed and
/// retried on the next scheduled check, and auth rejections
/// (`InvalidCredentials`, `Unauthorized`, `InvalidRefreshToken`), which
/// escalate to the session-expired path.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SessionError {
    /// The request never completed (transport failure, timeout, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// Login rejected by the authentication service.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// Access token rejected during verification.
    #[error("access token rejected")]
    Unauthorized,

    /// Refresh token rejected; the session cannot be silently renewed.
    #[error("refresh token rejected")]
    InvalidRefreshToken,

    /// Persisted session data is present but unparseable.
    #[error("corrupt persisted session data: {0}")]
    CorruptState(String),

    /// Operation attempted on an orchestrator after `destroy()`.
    #[error("session orchestrator has been destroyed")]
    Terminated,
}

impl SessionError {
    /// Whether this error is an authentication rejection rather than a
    /// transient failure. Auth rejections end the session; everything else
    /// is retried.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidCredentials
                | SessionError::Unauthorized
                | SessionError::InvalidRefreshToken
        )
    }

    /// Whether the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Network(_))
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::Network(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type SessionResult<T> = Result<T, SessionError>;
