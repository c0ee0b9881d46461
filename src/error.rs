//! Error types
// (c) 2026 The muxrpc authors

use crate::protocol::{CallError, CallType, CodecError};

/// Which direction of a stream an operation used
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// Reading from the stream
    Read,
    /// Writing to the stream
    Write,
}

/// Errors reported by the muxrpc transport
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream's call type does not permit this operation, or a once-only
    /// direction has already been used. This never reaches the wire.
    #[error("stream {id}: {direction} not permitted on this side of a {call_type} call")]
    StreamCapability {
        /// Stream id
        id: i32,
        /// Call type of the stream
        call_type: CallType,
        /// The direction that was attempted
        direction: Direction,
    },
    /// The stream was already closed with a different outcome, or is closed for writing
    #[error("stream {0} is already closed")]
    AlreadyClosed(i32),
    /// The whole session has ended
    #[error("muxrpc: session terminated")]
    SessionTerminated,
    /// The connection was closed locally
    #[error("muxrpc: sink closed")]
    SinkClosed,
    /// The caller cancelled the operation. The stream remains usable.
    #[error("operation cancelled")]
    Cancelled,
    /// An async call ended without producing a value
    #[error("call ended without a response")]
    NoResponse,
    /// The remote end reported an error
    #[error(transparent)]
    Call(#[from] CallError),
    /// The connection could not be read or written
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A JSON value could not be encoded or decoded
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Does this error mean the whole session is gone, as opposed to one call failing?
    #[must_use]
    pub fn is_session_terminated(&self) -> bool {
        matches!(self, Error::SessionTerminated | Error::SinkClosed)
    }

    /// Does this error mean the connection was closed under us?
    ///
    /// This includes the peer hanging up mid-write.
    #[must_use]
    pub fn is_sink_closed(&self) -> bool {
        match self {
            Error::SinkClosed | Error::SessionTerminated => true,
            Error::Codec(CodecError::Io(e)) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Maps a dead connection to [`Error::SessionTerminated`]
    pub(crate) fn into_session_error(self) -> Self {
        if self.is_sink_closed() {
            Error::SessionTerminated
        } else {
            self
        }
    }

    /// The remote call error, if that is what this is
    #[must_use]
    pub fn as_call_error(&self) -> Option<&CallError> {
        match self {
            Error::Call(ce) => Some(ce),
            _ => None,
        }
    }
}

/// Syntactic sugar
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a blocking wait ended early
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interruption {
    /// The caller's cancellation token fired
    Caller,
    /// The stream was closed, locally or by the peer
    StreamClosed,
    /// The session ended
    SessionTerminated,
}

impl From<Interruption> for Error {
    /// The stream's own disposition is reported separately; this maps only the
    /// cases that do not depend on it.
    fn from(value: Interruption) -> Self {
        match value {
            Interruption::Caller => Error::Cancelled,
            Interruption::StreamClosed | Interruption::SessionTerminated => {
                Error::SessionTerminated
            }
        }
    }
}
