//! Descriptor hand-off across a transport that cannot carry descriptors.
//!
//! vsock has no in-band descriptor passing, so a donated descriptor travels
//! as a token in a [`Message::FdTransfer`](vmux_proto::Message::FdTransfer)
//! frame. The token names a slot in an [`FdRegistry`], the out-of-band side
//! channel both dispatchers share wherever the deployment permits (same-host
//! transports, tests). A registry owns every donated descriptor until it is
//! resolved, so a failed transfer never leaks the source descriptor.

#![cfg(unix)]

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use vmux_proto::EndpointKind;

use crate::error::{Error, Result};
use crate::stream::{PipeStream, SocketStream, Stream};

/// Shared side registry of donated descriptors, keyed by transfer token.
///
/// Cloneable; clones share the same slots. Internally synchronized because
/// the two dispatchers resolving against it run on different threads.
#[derive(Debug, Clone, Default)]
pub struct FdRegistry {
    /// Token-indexed slots, plus the next token to issue.
    inner: Arc<Mutex<Slots>>,
}

/// Registry interior: issued tokens and parked descriptors.
#[derive(Debug, Default)]
struct Slots {
    /// Descriptors awaiting resolution.
    parked: HashMap<u64, OwnedFd>,
    /// Next token to issue; tokens are never reused within a registry.
    next_token: u64,
}

impl FdRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a donated descriptor and returns the token that names it.
    ///
    /// The registry takes ownership; the descriptor is closed when resolved
    /// and dropped by the receiver, or when the registry itself drops.
    pub fn send(&self, fd: OwnedFd) -> u64 {
        let mut slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let token = slots.next_token;
        slots.next_token += 1;
        slots.parked.insert(token, fd);
        token
    }

    /// Resolves a token into the parked descriptor, spending the token.
    ///
    /// Unknown or already-spent tokens fail with [`Error::FdTransfer`].
    pub fn receive(&self, token: u64) -> Result<OwnedFd> {
        let mut slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slots.parked.remove(&token).ok_or(Error::FdTransfer { token })
    }

    /// Number of descriptors currently parked.
    #[must_use]
    pub fn parked(&self) -> usize {
        let slots = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slots.parked.len()
    }
}

/// Wraps a freshly-resolved descriptor in the stream variant `endpoint`
/// names, bound to `handle`.
///
/// Called immediately on receipt so no raw descriptor crosses component
/// boundaries unowned.
pub fn wrap(fd: OwnedFd, endpoint: EndpointKind, handle: u32) -> Result<Box<dyn Stream>> {
    Ok(match endpoint {
        EndpointKind::PipeReader => Box::new(PipeStream::reader(fd, handle)?),
        EndpointKind::PipeWriter => Box::new(PipeStream::writer(fd, handle)?),
        EndpointKind::Socket => Box::new(SocketStream::new(fd, handle)?),
    })
}
