//! Unified error handling.
//!
//! A single [`struct@Error`] pairs an [`ErrorKind`] category with the
//! underlying error details. Categories follow the session's error taxonomy:
//! transport failures tear down the connection, server-reported command
//! errors are recoverable and surfaced to the caller, everything else is
//! local.

use std::fmt;

use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error.
    pub kind: ErrorKind,

    /// Details of the underlying error.
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for maestro operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The connection to the server is gone or could not be established.
    /// Fatal to the current connection attempt; triggers the reconnect cycle.
    #[error("server unavailable")]
    Unavailable,

    /// The server rejected a specific command. The connection stays usable
    /// and the server's message is passed on to the caller.
    #[error("command rejected")]
    Rejected,

    /// A request carried parameters that did not decode as expected.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// Authentication with the configured password failed.
    #[error("no valid authentication credentials")]
    Unauthenticated,

    /// A referenced entity (playlist, song, definition file) does not exist.
    #[error("not found")]
    NotFound,

    /// The operation needs a capability the server did not announce.
    #[error("not supported by server")]
    Unsupported,

    /// Local I/O or state failure not attributable to the server.
    #[error("internal error")]
    Internal,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    pub fn rejected<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Rejected, error)
    }

    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    pub fn unauthenticated<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unauthenticated, error)
    }

    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotFound, error)
    }

    pub fn unsupported<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unsupported, error)
    }

    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }

    /// Whether the error leaves the connection unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Unavailable | ErrorKind::Unauthenticated
        )
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(error),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::UnexpectedEof => Self::unavailable(error),
            _ => Self::internal(error),
        }
    }
}

impl From<mpd::error::Error> for Error {
    fn from(error: mpd::error::Error) -> Self {
        match &error {
            // The server answered with an ACK for one command; the
            // connection itself is fine.
            mpd::error::Error::Server(_) => Self::rejected(error),
            mpd::error::Error::Io(_)
            | mpd::error::Error::Parse(_)
            | mpd::error::Error::Proto(_) => Self::unavailable(error),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::invalid_argument(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Self::invalid_argument(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_connection_errors_are_fatal() {
        let error = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(error.is_fatal());
    }

    #[test]
    fn local_errors_are_not_fatal() {
        let error = Error::internal("sticker cache out of date");
        assert!(!error.is_fatal());
        assert_eq!(error.kind, ErrorKind::Internal);
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let error = Error::not_found("no such playlist");
        assert_eq!(error.to_string(), "not found: no such playlist");
    }
}
