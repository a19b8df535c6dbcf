use thiserror::Error;

use crate::frame::MAX_LINE_LEN;

/// Errors raised while reading or writing framed messages.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error on endpoint: {0}")]
    Io(#[from] std::io::Error),

    #[error("line exceeds maximum length of {MAX_LINE_LEN} bytes")]
    LineTooLong,

    #[error("message is not valid UTF-8")]
    NotUtf8,

    #[error("missing or non-numeric correlation id")]
    BadCorrelationId,

    #[error("message has no command field")]
    MissingCommand,

    #[error("field {index} contains a TAB or LF byte")]
    ForbiddenByte { index: usize },
}

impl FrameError {
    /// True for per-line failures the endpoint recovers from by reporting
    /// `error invalid protocol formatting` and reading the next line.
    pub fn is_per_line(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

/// Errors surfaced to callers of the client role.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("outbound message '{name}' failed validation")]
    InvalidOutbound { name: String },

    #[error("command was canceled")]
    Canceled,

    #[error("connection to peer was lost")]
    Disconnected,

    #[error(transparent)]
    Frame(#[from] FrameError),
}
