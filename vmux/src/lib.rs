//! Stream-multiplexing proxy over vsock for host↔guest communication.
//!
//! `vmux` turns arbitrary OS-level endpoints (pipe ends, connected sockets)
//! into uniform message-oriented [`Stream`](stream::Stream)s and relays many of them, each
//! named by a small integer handle, across one reliable transport
//! connection, typically a vsock link between a host and a guest VM.
//!
//! # Quick start
//!
//! ```no_run
//! use vmux::{FdRegistry, Muxer, Role, stream::FramedStream};
//!
//! let fd = vmux::vsock::connect(vmux::vsock::HOST_CID, vmux::PROXY_PORT)?;
//! let muxer = Muxer::new(
//!     FramedStream::new(fd)?,
//!     Role::Initiator,
//!     Box::new(vmux::UnixConnector),
//!     FdRegistry::new(),
//! )?;
//! let control = muxer.control();
//! std::thread::spawn(move || muxer.run());
//! // `control.open(..)` now exposes local endpoints to the peer.
//! # Ok::<(), vmux::Error>(())
//! ```

mod error;
#[cfg(unix)]
mod factory;
#[cfg(unix)]
mod fdpass;
#[cfg(unix)]
mod handle;
#[cfg(unix)]
mod mux;
pub mod stream;
#[cfg(target_os = "linux")]
pub mod vsock;

pub use error::{Error, Result};
#[cfg(unix)]
pub use factory::UnixConnector;
#[cfg(unix)]
pub use fdpass::FdRegistry;
#[cfg(unix)]
pub use handle::{ConvState, Entry, HandleTable, Role};
#[cfg(unix)]
pub use mux::{EndpointFactory, Muxer, MuxerHandle};
pub use vmux_proto::{EndpointKind, Message, PROXY_PORT};
