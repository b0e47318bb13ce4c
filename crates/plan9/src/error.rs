//! Error taxonomy of the client.
//!
//! Codec and allocator failures are returned to the immediate caller.
//! Failures of the connection itself ([`Error::Hungup`]) are broadcast to
//! every request that was waiting on it.

use std::io;

use thiserror::Error;

use crate::fcall::MsgType;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or oversized frame, string too long, too many walk elements,
    /// length prefix mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with `Rerror`.
    #[error("{0}")]
    Remote(String),

    /// Read or write failure on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The connection is dead; every outstanding and future request fails with this.
    #[error("connection hung up: {0}")]
    Hungup(String),

    /// No free tag or fid number.
    #[error("out of {0}")]
    Exhausted(&'static str),

    /// The request was cancelled with `Tflush` before any reply arrived.
    #[error("request flushed")]
    Flushed,

    /// A walk stopped before reaching the last element.
    #[error("file '{0}' not found")]
    NotFound(String),

    /// The reply type does not belong to the request.
    #[error("unexpected reply {got:?} to {sent:?}")]
    UnexpectedReply { sent: MsgType, got: MsgType },
}

impl Error {
    /// Whether the error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Hungup(_) | Error::Io(_))
    }
}
