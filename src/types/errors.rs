//! Kernel error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Handler
//! errors cross process boundaries as [`ErrorMessage`]; [`Error::to_reply`] and
//! [`Error::from_reply`] are the only conversion pair between the two forms so
//! that local and remote calls surface identical errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kernel result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire code for [`Error::Server`].
pub const CODE_SERVER_ERROR: &str = "SERVER_ERROR";

/// Application error carried in the `error` field of a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Main error enum for the mesh kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Generic internal failure: decode/marshal failures and recovered panics.
    #[error("server error: {0}")]
    Server(String),

    /// No live endpoint for a component, or the target endpoint is not live.
    #[error("not found: {0}")]
    NotFound(String),

    /// Dial/connect failure or a connection that is no longer usable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A remote call exceeded its fixed deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The distributed lock was not acquired within the retry budget.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// The lock backend could not be reached.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// Error returned by a component handler, passed through unchanged.
    #[error("application error: {0}")]
    Application(ErrorMessage),

    /// JSON errors (configuration documents).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Msgpack encode/decode errors on the wire.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable string code used on the wire and in logs.
    pub fn to_ipc_error_code(&self) -> &'static str {
        match self {
            Error::Server(_) | Error::Codec(_) | Error::Serialization(_) | Error::Io(_) => {
                CODE_SERVER_ERROR
            }
            Error::NotFound(_) => "NOT_FOUND",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Timeout(_) => "DEADLINE_EXCEEDED",
            Error::LockTimeout(_) => "LOCK_TIMEOUT",
            Error::LockUnavailable(_) => "LOCK_UNAVAILABLE",
            Error::Application(_) => "APPLICATION",
        }
    }

    /// Convert into the wire form carried by a reply envelope.
    ///
    /// Application errors keep their own code; every other kind is tagged
    /// with its IPC code.
    pub fn to_reply(&self) -> ErrorMessage {
        match self {
            Error::Application(msg) => msg.clone(),
            Error::Server(msg) => ErrorMessage::new(CODE_SERVER_ERROR, msg.clone()),
            other => ErrorMessage::new(other.to_ipc_error_code(), other.to_string()),
        }
    }

    /// Rebuild an error from a reply envelope's `error` field.
    pub fn from_reply(msg: ErrorMessage) -> Self {
        if msg.code == CODE_SERVER_ERROR {
            Error::Server(msg.message)
        } else {
            Error::Application(msg)
        }
    }

    /// Normalize an error produced by a handler the way it would look after a
    /// trip through a reply envelope.
    pub fn normalize_handler_error(self) -> Self {
        let reply = self.to_reply();
        Error::from_reply(reply)
    }

    /// Opaque numeric code for callers outside the mesh. Never carries
    /// endpoint, connection, or lock detail.
    pub fn public_code(&self) -> u32 {
        match self {
            Error::Application(_) => 1,
            Error::NotFound(_) | Error::Unavailable(_) => 2,
            Error::Timeout(_) => 3,
            Error::LockTimeout(_) | Error::LockUnavailable(_) => 4,
            _ => 500,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn lock_timeout(msg: impl Into<String>) -> Self {
        Self::LockTimeout(msg.into())
    }

    pub fn lock_unavailable(msg: impl Into<String>) -> Self {
        Self::LockUnavailable(msg.into())
    }

    pub fn application(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Application(ErrorMessage::new(code, message))
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
