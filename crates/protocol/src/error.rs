//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering malformed requests and responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The request line contained no verb.
    #[error("empty request")]
    EmptyRequest,

    /// The request line exceeds the configured maximum.
    #[error("request line too long: {len} bytes exceeds maximum of {max} bytes")]
    LineTooLong {
        /// Actual line length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The verb is not recognised at all.
    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    /// The verb was given the wrong number of arguments.
    #[error("{verb} expects {expected} argument(s), got {got}")]
    WrongArgumentCount {
        /// Canonical verb spelling.
        verb: &'static str,
        /// Required argument count.
        expected: usize,
        /// Arguments actually supplied.
        got: usize,
    },

    /// An argument cannot be represented with the chosen delimiter.
    #[error("argument {0:?} cannot be encoded on a request line")]
    UnencodableArgument(String),

    /// A response unit could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The input was not valid UTF-8.
    #[error("input is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<std::string::FromUtf8Error> for ProtocolError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        ProtocolError::InvalidUtf8
    }
}
