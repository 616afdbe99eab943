//! Error types for the request/reply library.
//!
//! Every fallible owner-facing call returns [`Result`]. Transient socket
//! conditions (`EINTR`, `EAGAIN`) are absorbed inside the loop thread and never
//! show up here; what does show up is either a construction failure, a send
//! that could not be queued, or a capacity limit.

use std::io;

use thiserror::Error;

use crate::value::CodecError;

/// Library error.
#[derive(Debug, Error)]
pub enum Error {
    /// An OS resource (socket, epoll, eventfd, thread) could not be created or used.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No runtime directory could be found for a relative socket name.
    #[error("cannot resolve socket path for {0:?}: no runtime directory")]
    Path(String),

    /// The resolved path does not fit in `sockaddr_un.sun_path`.
    #[error("socket path too long ({len} > {max}): {path}")]
    PathTooLong {
        /// The offending path.
        path: String,
        /// Its length in bytes.
        len: usize,
        /// The platform limit (excluding the NUL terminator).
        max: usize,
    },

    /// The sender is not connected.
    #[error("not connected")]
    NotConnected,

    /// Refused to send a zero-length message.
    #[error("refusing to send an empty message")]
    EmptyMessage,

    /// The write reported zero bytes (peer backpressure from the first byte).
    #[error("write failed: no bytes written")]
    WriteFailed,

    /// The pending-reply FIFO is at capacity.
    #[error("pending request queue full ({0} outstanding)")]
    QueueFull(usize),

    /// The request handler table is at capacity.
    #[error("request handler table full ({0} entries)")]
    HandlerTableFull(usize),

    /// A handler with this name is already registered.
    #[error("request handler already registered: {0}")]
    DuplicateHandler(String),

    /// A frame could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a request did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The server answered with a ReplyError frame.
    #[error("{0}")]
    Remote(String),

    /// The connection was lost before a reply arrived (empty payload).
    #[error("connection lost before reply")]
    ConnectionLost,

    /// The reply bytes were neither a ReplyOk nor a ReplyError frame.
    #[error("invalid reply")]
    InvalidReply,
}

impl RequestError {
    /// The server's error message, if this is a remote error.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Remote(msg) => Some(msg),
            _ => None,
        }
    }
}
