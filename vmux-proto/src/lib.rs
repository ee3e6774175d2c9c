//! Wire protocol for the vmux host↔guest stream multiplexer.
//!
//! A single vsock (or Unix socket, or TCP) connection carries many logical
//! conversations, each identified by a [`Message`] handle. Messages are
//! serialized with [`postcard`] and framed with a 4-byte big-endian length
//! prefix, suitable for any reliable ordered byte stream.

mod codec;
mod message;

pub use codec::{MAX_FRAME, ProtoError, decode, decode_partial, encode, encode_to_vec};
pub use message::{CONTROL_HANDLE, EndpointKind, Message, PROXY_PORT};
