//! Error types for vmux operations.

use vmux_proto::ProtoError;

/// Alias for `Result<T, vmux::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by vmux streams, the handle table, and the dispatcher.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A descriptor-level failure (broken pipe, reset connection).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A malformed or oversize frame on the transport.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// A message referenced an unknown or already-retired handle.
    #[error("unknown or retired handle {handle}")]
    Handle {
        /// The offending handle.
        handle: u32,
    },

    /// A descriptor hand-off failed (unknown or already-spent token).
    #[error("fd transfer failed for token {token}")]
    FdTransfer {
        /// The token that could not be resolved.
        token: u64,
    },

    /// A read or write against the wrong end of a half-duplex stream.
    ///
    /// This is a caller bug, not a runtime condition: a pipe stream built
    /// over a read-only descriptor can never service a write, and vice
    /// versa.
    #[error("{op} on a half-duplex stream lacking that capability")]
    HalfDuplex {
        /// The rejected operation.
        op: &'static str,
    },
}

#[cfg(unix)]
impl Error {
    /// Errno-style code for the wire-level `Error` message.
    ///
    /// Descriptor failures report their OS error code; everything else maps
    /// to a generic protocol failure (`EPROTO`).
    #[must_use]
    pub fn wire_code(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EPROTO,
        }
    }
}
