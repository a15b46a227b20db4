//! Contains the `Error` and `Result` types that `mongodb-legacy` uses.

use std::{fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

/// The result type for all methods that can return an error in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while operating on a MongoDB deployment. The inner
/// [`ErrorKind`] is boxed to keep the type small; the whole error is cloneable
/// so cursors can retain it as sticky state.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
        }
    }

    /// Creates an authentication error with the provided reason. The reason
    /// must never contain credential material.
    pub(crate) fn authentication_error(reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("authentication failure: {}", reason),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Self {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Self {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    /// Whether the underlying stream should be considered poisoned. I/O and
    /// framing errors invalidate the connection; server-side errors do not.
    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::InvalidResponse { .. } | ErrorKind::MessageSize { .. }
        )
    }

    #[allow(dead_code)]
    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    /// The server-provided error code, if this error carries one.
    pub fn code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(ref err) | ErrorKind::Query(ref err) => Some(err.code),
            ErrorKind::Write(ref err) => Some(err.code),
            _ => None,
        }
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into())
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<bson::raw::Error> for ErrorKind {
    fn from(err: bson::raw::Error) -> Self {
        Self::InvalidBson {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided to a driver method.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// The client failed to authenticate a connection.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(bson::ser::Error),

    /// A document embedded in a server reply was corrupt.
    #[error("Invalid BSON in server reply: {message}")]
    #[non_exhaustive]
    InvalidBson { message: String },

    /// The server returned an error to an attempted command.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The server-side cursor is invalid or has expired.
    #[error("{message}")]
    #[non_exhaustive]
    CursorNotFound { message: String },

    /// An error occurred during DNS resolution.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// A collection or database namespace failed validation.
    #[error("Invalid namespace: {message}")]
    #[non_exhaustive]
    InvalidNamespace { message: String },

    /// The server returned a reply that violates the wire protocol.
    #[error("Invalid server reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// A message exceeded the deployment's size limits, or a reply was too
    /// short to contain a header.
    #[error("{message}")]
    #[non_exhaustive]
    MessageSize { message: String },

    /// The server reported a query failure via the QUERY_FAILURE reply flag.
    #[error("Query failure: {0}")]
    Query(CommandError),

    /// The client was not able to select a server for the operation.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    #[error("{message}")]
    #[non_exhaustive]
    InvalidTlsConfig { message: String },

    /// The server reported a failed write through the getLastError document.
    #[error("Write failed: {0}")]
    Write(WriteError),
}

/// An error returned by the server in response to a command, or embedded in a
/// QUERY_FAILURE reply document.
#[derive(Clone, Debug, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    #[serde(default)]
    pub code: i32,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {}: {}", self.code, self.message)
    }
}

/// An error reported through the `err` field of a getLastError reply.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The server's description of the failure.
    pub message: String,
}

impl fmt::Display for WriteError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Error code {}: {}", self.code, self.message)
    }
}
