//! Error types for tes-rs.

use thiserror::Error;

use crate::model::State;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    /// One message per violated invariant, in task field order.
    #[error("{}", .0.join("\n"))]
    Validation(Vec<String>),

    #[error("unauthorized")]
    Unauthorized,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("canceled")]
    Canceled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the failed operation could succeed.
    ///
    /// Validation, lookup and state-transition failures are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::WouldBlock
            ),
            Error::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                e.status()
                    .map(|s| s.is_server_error() || s.as_u16() == 429)
                    .unwrap_or(false)
            }
            Error::Sqlx(e) => matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)),
            Error::Sled(e) => matches!(e, sled::Error::Io(_)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
