//! The multiplexing dispatcher: one transport, many conversations.
//!
//! A [`Muxer`] pumps [`Message`]s between the framed transport and the set
//! of locally-registered endpoint streams. It is a single-threaded
//! readiness loop over `poll(2)`: the handle table is mutated only from the
//! loop, every descriptor is owned by exactly one conversation, and
//! messages for one handle are relayed strictly in arrival order.
//!
//! All descriptors are non-blocking. Writes a descriptor will not accept
//! queue inside the owning stream, and queues are drained when `poll`
//! reports write-readiness, so one stalled consumer cannot block the loop
//! and starve the other conversations.
//!
//! Control requests (open a conversation, donate a descriptor, close, shut
//! down) arrive through a cloneable [`MuxerHandle`] backed by an mpsc
//! channel plus a self-pipe that wakes the poll loop.

#![cfg(unix)]

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::sync::mpsc;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, warn};
use vmux_proto::{CONTROL_HANDLE, EndpointKind, Message};

use crate::error::{Error, Result};
use crate::fdpass::{self, FdRegistry};
use crate::handle::{ConvState, HandleTable, Role};
use crate::stream::{FramedStream, ReadEvent, Stream};

/// Builds the local endpoint that an inbound `Open` requests.
///
/// The dispatcher is transport- and deployment-agnostic; what a cookie
/// means (a Unix socket path to connect, a pre-registered pipe, ...) is the
/// consumer's business.
pub trait EndpointFactory: Send {
    /// Creates the endpoint of `endpoint` kind named by `cookie`, bound to
    /// `handle`.
    fn create(&mut self, endpoint: EndpointKind, cookie: &str, handle: u32)
    -> Result<Box<dyn Stream>>;
}

/// A control request from a [`MuxerHandle`].
#[derive(Debug)]
enum Command {
    /// Expose a local endpoint to the peer.
    Open {
        /// Local descriptor; wrapped in the complement of `endpoint`.
        local: OwnedFd,
        /// Endpoint kind the peer must create.
        endpoint: EndpointKind,
        /// Remote resource name forwarded in the `Open` message.
        cookie: String,
    },
    /// Donate a descriptor to the peer via the side registry.
    Transfer {
        /// This side's endpoint of the new conversation.
        local: OwnedFd,
        /// The descriptor crossing over.
        donated: OwnedFd,
        /// Endpoint kind the peer must wrap `donated` in.
        endpoint: EndpointKind,
    },
    /// Close one conversation.
    Close {
        /// Conversation handle.
        handle: u32,
    },
    /// Stop the loop, closing every conversation.
    Shutdown,
}

/// Whether the loop keeps running after handling an event batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// One `poll` round's worth of readiness, split by descriptor and
/// direction.
#[derive(Debug, Default)]
struct Readiness {
    /// The wake self-pipe has queued commands behind it.
    wake: bool,
    /// The transport has inbound bytes (or hung up).
    transport_read: bool,
    /// The transport accepts queued outbound bytes.
    transport_write: bool,
    /// Handles whose endpoint has inbound bytes.
    readable: Vec<u32>,
    /// Handles whose endpoint accepts queued outbound bytes.
    writable: Vec<u32>,
}

/// Cloneable control surface for a running [`Muxer`].
#[derive(Debug, Clone)]
pub struct MuxerHandle {
    /// Command queue into the loop.
    tx: mpsc::Sender<Command>,
    /// Write end of the self-pipe that wakes `poll`.
    wake: Arc<OwnedFd>,
}

impl MuxerHandle {
    /// Exposes a local endpoint: the peer is asked to create an `endpoint`
    /// for `cookie`, and `local` becomes this side's end of the
    /// conversation (wrapped in the complementary stream kind).
    pub fn open(&self, local: OwnedFd, endpoint: EndpointKind, cookie: impl Into<String>) -> Result<()> {
        self.send(Command::Open {
            local,
            endpoint,
            cookie: cookie.into(),
        })
    }

    /// Donates `donated` to the peer through the fd side registry, keeping
    /// `local` as this side's endpoint of the new conversation.
    pub fn transfer_fd(&self, local: OwnedFd, donated: OwnedFd, endpoint: EndpointKind) -> Result<()> {
        self.send(Command::Transfer {
            local,
            donated,
            endpoint,
        })
    }

    /// Requests the close of one conversation.
    pub fn close(&self, handle: u32) -> Result<()> {
        self.send(Command::Close { handle })
    }

    /// Stops the loop; every live conversation is driven to closed and all
    /// owned descriptors are released.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    /// Queues a command and wakes the poll loop.
    fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "muxer is gone")))?;
        // A single byte; the loop drains the pipe on wakeup.
        nix::unistd::write(self.wake.as_fd(), &[0u8])
            .map_err(|e| Error::Io(io::Error::from(e)))?;
        Ok(())
    }
}

/// The multiplexing proxy: owns the transport, the handle table, and the fd
/// side registry, and relays until shutdown or transport failure.
pub struct Muxer {
    /// The framed transport backbone (not in the handle table).
    transport: FramedStream,
    /// Live conversations.
    table: HandleTable,
    /// Side registry for descriptor hand-off.
    registry: FdRegistry,
    /// Builds local endpoints for inbound `Open` requests.
    factory: Box<dyn EndpointFactory>,
    /// Control command queue.
    commands: mpsc::Receiver<Command>,
    /// Read end of the wake self-pipe.
    wake_rx: OwnedFd,
    /// Template for [`Muxer::control`] handles.
    control: MuxerHandle,
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("table", &self.table)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Muxer {
    /// Creates a dispatcher over a connected transport.
    ///
    /// `role` decides the handle parity this side allocates from; the side
    /// that called connect is the [`Role::Initiator`]. `registry` is the fd
    /// side channel, shared with the peer dispatcher where the deployment
    /// allows it.
    pub fn new(
        transport: FramedStream,
        role: Role,
        factory: Box<dyn EndpointFactory>,
        registry: FdRegistry,
    ) -> Result<Self> {
        let (wake_rx, wake_tx) = nix::unistd::pipe().map_err(io::Error::from)?;
        let (tx, commands) = mpsc::channel();
        Ok(Self {
            transport,
            table: HandleTable::new(role),
            registry,
            factory,
            commands,
            wake_rx,
            control: MuxerHandle {
                tx,
                wake: Arc::new(wake_tx),
            },
        })
    }

    /// A cloneable control handle for this dispatcher.
    #[must_use]
    pub fn control(&self) -> MuxerHandle {
        self.control.clone()
    }

    /// Runs the relay loop until shutdown, transport end-of-file, or a
    /// transport-fatal error.
    ///
    /// On any exit path every live conversation is driven to closed and all
    /// owned descriptors are released; the error, if any, is the transport
    /// failure.
    pub fn run(mut self) -> Result<()> {
        let result = self.pump();
        if result.is_ok() {
            self.settle_transport();
        }
        // No descriptor outlives the loop.
        self.table.drain();
        result
    }

    /// Best-effort drain of queued transport frames before the loop exits,
    /// so shutdown `Close` messages are not lost with the connection.
    fn settle_transport(&mut self) {
        while self.transport.has_pending() {
            let mut fds = [PollFd::new(self.transport.poll_fd(), PollFlags::POLLOUT)];
            match poll(&mut fds, PollTimeout::from(1000u16)) {
                Ok(n) if n > 0 => {
                    if self.transport.flush().is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    /// The poll loop proper.
    fn pump(&mut self) -> Result<()> {
        loop {
            let ready = match self.wait() {
                Ok(sets) => sets,
                Err(Error::Io(e)) if e.raw_os_error() == Some(Errno::EINTR as i32) => continue,
                Err(e) => return Err(e),
            };

            if ready.wake && self.drain_commands()? == Flow::Stop {
                return Ok(());
            }

            if ready.transport_write {
                self.transport.flush()?;
            }

            if ready.transport_read && self.service_transport()? == Flow::Stop {
                return Ok(());
            }

            for handle in ready.writable {
                self.flush_local(handle)?;
            }

            for handle in ready.readable {
                self.service_local(handle)?;
            }
        }
    }

    /// Polls the wake pipe, the transport, and every endpoint with read or
    /// write interest.
    fn wait(&mut self) -> Result<Readiness> {
        let read_mask = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        // A hangup or error must reach the flush path too, so a broken
        // consumer with queued bytes is torn down instead of parked forever.
        let write_mask = PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;

        let mut interests: Vec<(u32, PollFlags)> = Vec::new();
        for handle in self.table.handles() {
            let Some(stream) = self.table.get(handle).and_then(|e| e.stream.as_ref()) else {
                continue;
            };
            let mut interest = PollFlags::empty();
            if stream.readable() {
                interest |= PollFlags::POLLIN;
            }
            if stream.has_pending() {
                interest |= PollFlags::POLLOUT;
            }
            if !interest.is_empty() {
                interests.push((handle, interest));
            }
        }

        let mut transport_interest = PollFlags::POLLIN;
        if self.transport.has_pending() {
            transport_interest |= PollFlags::POLLOUT;
        }

        let mut fds = Vec::with_capacity(interests.len() + 2);
        fds.push(PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN));
        fds.push(PollFd::new(self.transport.poll_fd(), transport_interest));
        for &(handle, interest) in &interests {
            // Collected above; entries cannot vanish between the two passes.
            if let Some(stream) = self.table.get(handle).and_then(|e| e.stream.as_ref()) {
                fds.push(PollFd::new(stream.poll_fd(), interest));
            }
        }

        poll(&mut fds, PollTimeout::NONE).map_err(|e| Error::Io(io::Error::from(e)))?;

        let revents = |fd: &PollFd<'_>| fd.revents().unwrap_or_else(PollFlags::empty);
        let mut ready = Readiness {
            wake: revents(&fds[0]).intersects(read_mask),
            transport_read: revents(&fds[1]).intersects(read_mask),
            transport_write: revents(&fds[1]).intersects(PollFlags::POLLOUT),
            ..Readiness::default()
        };
        for ((handle, interest), fd) in interests.iter().zip(&fds[2..]) {
            let r = revents(fd);
            if interest.contains(PollFlags::POLLIN) && r.intersects(read_mask) {
                ready.readable.push(*handle);
            }
            if interest.contains(PollFlags::POLLOUT) && r.intersects(write_mask) {
                ready.writable.push(*handle);
            }
        }
        Ok(ready)
    }

    /// Empties the wake pipe and processes every queued command.
    fn drain_commands(&mut self) -> Result<Flow> {
        let mut sink = [0u8; 64];
        nix::unistd::read(self.wake_rx.as_fd(), &mut sink).map_err(io::Error::from)?;

        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Open {
                    local,
                    endpoint,
                    cookie,
                } => {
                    match self.table.allocate(|h| fdpass::wrap(local, endpoint.peer(), h)) {
                        Ok(handle) => {
                            debug!(handle, ?endpoint, %cookie, "opening conversation");
                            self.transport.send(&Message::Open {
                                handle,
                                endpoint,
                                cookie,
                            })?;
                        }
                        Err(e) => warn!(error = %e, "could not wrap local endpoint"),
                    }
                }
                Command::Transfer {
                    local,
                    donated,
                    endpoint,
                } => {
                    match self.table.allocate(|h| fdpass::wrap(local, endpoint.peer(), h)) {
                        Ok(handle) => {
                            let token = self.registry.send(donated);
                            debug!(handle, token, ?endpoint, "transferring descriptor");
                            self.transport.send(&Message::FdTransfer {
                                handle,
                                endpoint,
                                token,
                            })?;
                        }
                        // The donated fd is dropped with the command.
                        Err(e) => warn!(error = %e, "could not wrap local endpoint"),
                    }
                }
                Command::Close { handle } => self.close_local(handle)?,
                Command::Shutdown => {
                    debug!("shutdown requested");
                    for handle in self.table.handles() {
                        // Best effort: the peer may already be gone.
                        let _ = self.transport.send(&Message::Close { handle });
                    }
                    return Ok(Flow::Stop);
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// One read syscall on the transport, then drains every completed frame.
    fn service_transport(&mut self) -> Result<Flow> {
        match self.transport.fill() {
            Ok(0) => {
                debug!("transport closed by peer");
                return Ok(Flow::Stop);
            }
            Ok(_) => {}
            Err(Error::Io(e))
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return Ok(Flow::Continue);
            }
            Err(e) => {
                error!(error = %e, "transport read failed");
                return Err(e);
            }
        }
        while let Some(msg) = self.transport.next_buffered()? {
            if self.route(msg)? == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Routes one inbound message to its conversation.
    ///
    /// Errors returned here are transport-fatal; anything local to one
    /// conversation is contained (logged, answered, entry released).
    fn route(&mut self, msg: Message) -> Result<Flow> {
        match msg {
            Message::Open {
                handle,
                endpoint,
                cookie,
            } => {
                debug!(handle, ?endpoint, %cookie, "inbound open");
                match self.factory.create(endpoint, &cookie, handle) {
                    Ok(stream) => {
                        if let Err(e) = self.table.bind(handle, stream) {
                            warn!(handle, error = %e, "open for an occupied handle dropped");
                        }
                    }
                    Err(e) => {
                        warn!(handle, %cookie, error = %e, "endpoint creation failed");
                        self.transport.send(&Message::Error {
                            handle,
                            code: e.wire_code(),
                        })?;
                    }
                }
            }
            Message::Data { handle, payload } => self.deliver(handle, payload)?,
            Message::Close { handle } => {
                let closing = self
                    .table
                    .get_mut(handle)
                    .is_some_and(|e| e.state == ConvState::Closing);
                if self.table.release(handle) {
                    debug!(handle, "conversation closed by peer");
                    if !closing {
                        // Acknowledge so the peer can retire the handle too.
                        self.transport.send(&Message::Close { handle })?;
                    }
                } else {
                    // A late close racing a released handle is expected noise.
                    debug!(handle, "stale close dropped");
                }
            }
            Message::Error { handle, code } => {
                if handle == CONTROL_HANDLE {
                    error!(code, "peer reported a transport-fatal error");
                    return Err(Error::Io(io::Error::other(format!(
                        "peer reported transport failure (code {code})"
                    ))));
                }
                warn!(handle, code, "conversation failed on the peer side");
                self.table.release(handle);
            }
            Message::FdTransfer {
                handle,
                endpoint,
                token,
            } => match self
                .registry
                .receive(token)
                .and_then(|fd| fdpass::wrap(fd, endpoint, handle))
            {
                Ok(stream) => {
                    debug!(handle, token, ?endpoint, "inbound descriptor");
                    // Bound immediately; a bind clash closes the fd here.
                    if let Err(e) = self.table.bind(handle, stream) {
                        warn!(handle, error = %e, "fd transfer for an occupied handle dropped");
                    }
                }
                Err(e) => {
                    warn!(handle, token, error = %e, "fd transfer failed");
                    self.transport.send(&Message::Error {
                        handle,
                        code: libc::EBADF,
                    })?;
                }
            },
            _ => warn!("unknown message kind dropped"),
        }
        Ok(Flow::Continue)
    }

    /// Writes an inbound payload into the local endpoint of `handle`.
    fn deliver(&mut self, handle: u32, payload: Vec<u8>) -> Result<()> {
        let msg = Message::Data { handle, payload };
        match self.table.get_mut(handle) {
            Some(entry) => match (&mut entry.stream, entry.state) {
                (Some(stream), ConvState::Established | ConvState::Opening) => {
                    // First traffic from the peer confirms the conversation.
                    entry.state = ConvState::Established;
                    if let Err(e) = stream.write(&msg) {
                        warn!(handle, error = %e, "local endpoint write failed");
                        let code = e.wire_code();
                        self.table.release(handle);
                        self.transport.send(&Message::Error { handle, code })?;
                        self.transport.send(&Message::Close { handle })?;
                    }
                }
                _ => debug!(handle, "data for a closing conversation dropped"),
            },
            None => warn!(handle, "data for an unknown handle dropped"),
        }
        Ok(())
    }

    /// Drains an endpoint's queued outbound bytes after write-readiness.
    fn flush_local(&mut self, handle: u32) -> Result<()> {
        let Some(entry) = self.table.get_mut(handle) else {
            return Ok(());
        };
        let Some(stream) = entry.stream.as_mut() else {
            return Ok(());
        };
        if let Err(e) = stream.flush() {
            warn!(handle, error = %e, "local endpoint flush failed");
            let code = e.wire_code();
            self.table.release(handle);
            self.transport.send(&Message::Error { handle, code })?;
            self.transport.send(&Message::Close { handle })?;
        }
        Ok(())
    }

    /// One read on a readable local endpoint, relayed outward.
    fn service_local(&mut self, handle: u32) -> Result<()> {
        // The handle may have been released while draining earlier events.
        let Some(entry) = self.table.get_mut(handle) else {
            return Ok(());
        };
        let Some(stream) = entry.stream.as_mut() else {
            return Ok(());
        };

        match stream.read() {
            Ok(ReadEvent::Message(msg)) => self.transport.send(&msg)?,
            Ok(ReadEvent::Incomplete) => {}
            Ok(ReadEvent::Eof) => {
                debug!(handle, "local endpoint closed");
                self.close_local(handle)?;
            }
            Err(e) => {
                warn!(handle, error = %e, "local endpoint read failed");
                let code = e.wire_code();
                self.table.release(handle);
                self.transport.send(&Message::Error { handle, code })?;
                self.transport.send(&Message::Close { handle })?;
            }
        }
        Ok(())
    }

    /// Drops the local endpoint and starts the close handshake.
    ///
    /// The entry stays in the table (state `Closing`) so the handle is not
    /// reused before the peer acknowledges with its own `Close`.
    fn close_local(&mut self, handle: u32) -> Result<()> {
        match self.table.get_mut(handle) {
            Some(entry) if entry.state != ConvState::Closing => {
                entry.stream = None;
                entry.state = ConvState::Closing;
                self.transport.send(&Message::Close { handle })?;
            }
            Some(_) => {}
            None => debug!(handle, "close for an unknown handle ignored"),
        }
        Ok(())
    }
}
