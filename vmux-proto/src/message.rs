//! Protocol message types for multiplexed host↔guest conversations.

use serde::{Deserialize, Serialize};

/// Default vsock port for the vmux proxy daemon.
pub const PROXY_PORT: u32 = 4100;

/// Reserved handle for transport-level control traffic.
///
/// Never allocated for a conversation; an [`Message::Error`] tagged with it
/// is fatal to the whole proxy rather than to one conversation.
pub const CONTROL_HANDLE: u32 = 0;

/// Kind of local endpoint the *receiving* side of an [`Message::Open`] or
/// [`Message::FdTransfer`] must create or wrap.
///
/// Pipe endpoints are half-duplex: the variant names the capability the
/// receiver gets, so a sender holding the read end of a pipe asks the peer
/// for a `PipeWriter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Read end of a pipe (receiver relays bytes out of it).
    PipeReader,
    /// Write end of a pipe (receiver delivers bytes into it).
    PipeWriter,
    /// Full-duplex connected socket.
    Socket,
}

impl EndpointKind {
    /// The endpoint kind held by the opposite side of a conversation of
    /// this kind: the two ends of a pipe complement each other, sockets are
    /// symmetric.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::PipeReader => Self::PipeWriter,
            Self::PipeWriter => Self::PipeReader,
            Self::Socket => Self::Socket,
        }
    }
}

/// One protocol unit on the multiplexed transport.
///
/// Every variant names the conversation it belongs to by `handle`. A
/// conversation is opened by [`Message::Open`] or [`Message::FdTransfer`],
/// carries payload via [`Message::Data`], and ends with [`Message::Close`]
/// or [`Message::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Message {
    /// Ask the peer to create a local endpoint bound to `handle`.
    Open {
        /// Conversation handle chosen by the sender.
        handle: u32,
        /// Endpoint kind the receiver must create.
        endpoint: EndpointKind,
        /// Names the remote resource to connect (e.g. a socket path);
        /// interpreted by the receiving side's endpoint factory.
        cookie: String,
    },
    /// Ordered payload bytes for an established conversation.
    Data {
        /// Conversation handle.
        handle: u32,
        /// Raw bytes read from one endpoint, to be written into the other.
        payload: Vec<u8>,
    },
    /// Graceful end of a conversation. Carries no payload by construction.
    Close {
        /// Conversation handle.
        handle: u32,
    },
    /// A conversation (or, with [`CONTROL_HANDLE`], the transport) failed.
    Error {
        /// Conversation handle, or [`CONTROL_HANDLE`] for a fatal error.
        handle: u32,
        /// Errno-style error code from the failing side.
        code: i32,
    },
    /// A descriptor donated to the peer, referenced by a side-registry token.
    ///
    /// Used instead of in-band descriptor passing because vsock cannot carry
    /// descriptors; the receiver resolves `token` against the shared
    /// out-of-band registry.
    FdTransfer {
        /// Conversation handle chosen by the sender.
        handle: u32,
        /// Endpoint kind the receiver must wrap the descriptor in.
        endpoint: EndpointKind,
        /// Token naming the descriptor in the side registry.
        token: u64,
    },
}

impl Message {
    /// The conversation this message belongs to.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        match self {
            Self::Open { handle, .. }
            | Self::Data { handle, .. }
            | Self::Close { handle }
            | Self::Error { handle, .. }
            | Self::FdTransfer { handle, .. } => *handle,
        }
    }
}
