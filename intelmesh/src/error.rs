// intelmesh/src/error.rs
//
// Boundary error kinds. Component-internal failures are logged where they
// happen and translated into one of these before leaving the facade.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    /// Malformed IOC payload: missing field, unknown type, or a value that
    /// fails canonicalization.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    /// Handler exceeded its deadline; submissions are idempotent so the
    /// client may retry.
    #[error("handler deadline exceeded")]
    Timeout,

    /// Admin operation collided with current state (e.g. expiring an
    /// already-expired IOC). Never produced by normal submissions.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl CoordError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound      => "not_found",
            Self::Timeout       => "timeout",
            Self::Conflict(_)   => "conflict",
            Self::Internal(_)   => "internal",
        }
    }
}

impl From<sled::Error> for CoordError {
    fn from(e: sled::Error) -> Self {
        Self::Internal(format!("store: {e}"))
    }
}

impl From<serde_json::Error> for CoordError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("codec: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CoordError>;
