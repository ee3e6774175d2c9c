//! Message-oriented streams over raw OS descriptors.
//!
//! A [`Stream`] hides the difference between a half-duplex pipe, a
//! full-duplex socket, and the framed multiplexer transport behind one
//! read/write contract operating on whole [`Message`]s. Local endpoints
//! ([`PipeStream`], [`SocketStream`]) chunk raw bytes into `Data` messages
//! tagged with their conversation handle; the transport ([`FramedStream`])
//! carries whole frames via the [`vmux_proto`] codec.
//!
//! Descriptors are switched to non-blocking mode on construction. The
//! dispatcher only calls [`Stream::read`] after `poll(2)` reported
//! readability, and a spurious wakeup reports [`ReadEvent::Incomplete`].
//! Writes deliver what the descriptor accepts immediately and queue the
//! rest; the queue is drained on write-readiness via [`Stream::flush`]. A
//! stream never blocks the event loop, however slow the far consumer is.

#![cfg(unix)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use vmux_proto::Message;

use crate::error::{Error, Result};

/// Bytes pulled from a local endpoint per read, and thus the largest `Data`
/// payload a single endpoint read produces.
pub const CHUNK_SIZE: usize = 4096;

/// Outcome of one non-blocking read pass over a stream.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReadEvent {
    /// One complete message.
    Message(Message),
    /// No complete message yet: a partial frame on the framed transport,
    /// or a wakeup with nothing to read.
    Incomplete,
    /// Clean end-of-file; the peer is gone and no error occurred.
    Eof,
}

/// One OS-level byte/descriptor channel, read and written in [`Message`]s.
///
/// Each implementation exclusively owns its descriptor and closes it exactly
/// once, on drop.
pub trait Stream: Send {
    /// Pulls the next message, if one is available.
    ///
    /// Call only when the descriptor from [`Stream::poll_fd`] is readable.
    fn read(&mut self) -> Result<ReadEvent>;

    /// Queues one message for delivery and flushes as much as the
    /// descriptor accepts without blocking.
    fn write(&mut self, msg: &Message) -> Result<()>;

    /// Drains queued outbound bytes; call after the descriptor polled
    /// writable.
    fn flush(&mut self) -> Result<()>;

    /// Whether outbound bytes are queued awaiting write-readiness.
    fn has_pending(&self) -> bool;

    /// Descriptor to register for readiness polling.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    /// Whether this stream can produce inbound data at all.
    ///
    /// Write-only pipe ends return `false` and are left out of the read
    /// poll set; everything else is readable.
    fn readable(&self) -> bool {
        true
    }
}

/// Puts a descriptor into non-blocking mode.
fn set_nonblocking(fd: BorrowedFd<'_>) -> io::Result<()> {
    let flags = OFlag::from_bits_retain(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Writes as much of `out` as the descriptor accepts without blocking,
/// leaving the remainder queued.
fn flush_bytes(w: &mut impl Write, out: &mut Vec<u8>) -> Result<()> {
    while !out.is_empty() {
        match w.write(out) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => {
                out.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// One chunked read off a byte endpoint, wrapped as a `Data` message.
fn read_chunk(r: &mut impl Read, handle: u32) -> Result<ReadEvent> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    match r.read(&mut chunk) {
        Ok(0) => Ok(ReadEvent::Eof),
        Ok(n) => {
            chunk.truncate(n);
            Ok(ReadEvent::Message(Message::Data {
                handle,
                payload: chunk,
            }))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadEvent::Incomplete),
        Err(e) => Err(e.into()),
    }
}

/// Which end of a pipe a [`PipeStream`] wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// Half-duplex stream over one end of a pipe.
///
/// Reads chunk pipe bytes into `Data` messages tagged with the conversation
/// handle; writes deliver `Data` payloads into the pipe. A stream built over
/// the read end rejects writes (and vice versa) with [`Error::HalfDuplex`].
#[derive(Debug)]
pub struct PipeStream {
    /// The owned pipe end.
    file: File,
    /// Which capability this end has.
    direction: Direction,
    /// Conversation handle stamped on produced `Data` messages.
    handle: u32,
    /// Outbound bytes the pipe has not accepted yet.
    out: Vec<u8>,
}

impl PipeStream {
    /// Wraps the read end of a pipe.
    pub fn reader(fd: OwnedFd, handle: u32) -> io::Result<Self> {
        set_nonblocking(fd.as_fd())?;
        Ok(Self {
            file: File::from(fd),
            direction: Direction::Read,
            handle,
            out: Vec::new(),
        })
    }

    /// Wraps the write end of a pipe.
    pub fn writer(fd: OwnedFd, handle: u32) -> io::Result<Self> {
        set_nonblocking(fd.as_fd())?;
        Ok(Self {
            file: File::from(fd),
            direction: Direction::Write,
            handle,
            out: Vec::new(),
        })
    }
}

impl Stream for PipeStream {
    fn read(&mut self) -> Result<ReadEvent> {
        if self.direction != Direction::Read {
            return Err(Error::HalfDuplex { op: "read" });
        }
        read_chunk(&mut self.file, self.handle)
    }

    fn write(&mut self, msg: &Message) -> Result<()> {
        if self.direction != Direction::Write {
            return Err(Error::HalfDuplex { op: "write" });
        }
        let Message::Data { payload, .. } = msg else {
            return Err(Error::HalfDuplex { op: "non-data write" });
        };
        self.out.extend_from_slice(payload);
        flush_bytes(&mut self.file, &mut self.out)
    }

    fn flush(&mut self) -> Result<()> {
        flush_bytes(&mut self.file, &mut self.out)
    }

    fn has_pending(&self) -> bool {
        !self.out.is_empty()
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    fn readable(&self) -> bool {
        self.direction == Direction::Read
    }
}

/// Full-duplex stream over a connected stream socket.
///
/// Same `Data` chunking as [`PipeStream`], in both directions.
#[derive(Debug)]
pub struct SocketStream {
    /// The owned connected socket.
    socket: UnixStream,
    /// Conversation handle stamped on produced `Data` messages.
    handle: u32,
    /// Outbound bytes the socket has not accepted yet.
    out: Vec<u8>,
}

impl SocketStream {
    /// Takes sole ownership of an already-connected socket descriptor.
    pub fn new(fd: OwnedFd, handle: u32) -> io::Result<Self> {
        set_nonblocking(fd.as_fd())?;
        Ok(Self {
            socket: UnixStream::from(fd),
            handle,
            out: Vec::new(),
        })
    }
}

impl Stream for SocketStream {
    fn read(&mut self) -> Result<ReadEvent> {
        read_chunk(&mut self.socket, self.handle)
    }

    fn write(&mut self, msg: &Message) -> Result<()> {
        let Message::Data { payload, .. } = msg else {
            return Err(Error::HalfDuplex { op: "non-data write" });
        };
        self.out.extend_from_slice(payload);
        flush_bytes(&mut self.socket, &mut self.out)
    }

    fn flush(&mut self) -> Result<()> {
        flush_bytes(&mut self.socket, &mut self.out)
    }

    fn has_pending(&self) -> bool {
        !self.out.is_empty()
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

/// The multiplexer transport viewed as a stream of whole [`Message`] frames.
///
/// Wraps any reliable ordered byte channel (vsock connection, Unix socket,
/// one half of a socketpair in tests). Inbound bytes accumulate in a buffer
/// drained through [`vmux_proto::decode_partial`], so one transport read can
/// yield zero, one, or many messages.
#[derive(Debug)]
pub struct FramedStream {
    /// The owned transport descriptor.
    file: File,
    /// Accumulated inbound bytes not yet forming a complete frame.
    rx: Vec<u8>,
    /// Encoded outbound frames the descriptor has not accepted yet.
    out: Vec<u8>,
}

impl FramedStream {
    /// Takes sole ownership of a connected transport descriptor.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_fd())?;
        Ok(Self {
            file: File::from(fd),
            rx: Vec::new(),
            out: Vec::new(),
        })
    }

    /// Performs exactly one read syscall into the receive buffer.
    ///
    /// Returns the number of bytes pulled; `Ok(0)` is a clean end-of-file.
    /// EOF in the middle of a buffered frame is a truncation error, and a
    /// spurious wakeup surfaces `WouldBlock` unchanged. Drain completed
    /// frames with [`FramedStream::next_buffered`].
    pub fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; CHUNK_SIZE];
        let n = self.file.read(&mut chunk)?;
        if n == 0 && !self.rx.is_empty() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        self.rx.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Pops the next fully-buffered message without touching the descriptor.
    pub fn next_buffered(&mut self) -> Result<Option<Message>> {
        match vmux_proto::decode_partial(&self.rx)? {
            Some((msg, consumed)) => {
                self.rx.drain(..consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Encodes one frame, queues it, and flushes as much as the descriptor
    /// accepts without blocking.
    pub fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = vmux_proto::encode_to_vec(msg)?;
        self.out.extend_from_slice(&frame);
        flush_bytes(&mut self.file, &mut self.out)
    }
}

impl Stream for FramedStream {
    /// Returns a buffered message if one is complete, otherwise performs one
    /// read syscall and retries the buffer.
    fn read(&mut self) -> Result<ReadEvent> {
        if let Some(msg) = self.next_buffered()? {
            return Ok(ReadEvent::Message(msg));
        }
        match self.fill() {
            Ok(0) => Ok(ReadEvent::Eof),
            Ok(_) => match self.next_buffered()? {
                Some(msg) => Ok(ReadEvent::Message(msg)),
                None => Ok(ReadEvent::Incomplete),
            },
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(ReadEvent::Incomplete)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, msg: &Message) -> Result<()> {
        self.send(msg)
    }

    fn flush(&mut self) -> Result<()> {
        flush_bytes(&mut self.file, &mut self.out)
    }

    fn has_pending(&self) -> bool {
        !self.out.is_empty()
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().unwrap()
    }

    fn socketpair_fds() -> (OwnedFd, OwnedFd) {
        let (a, b) = UnixStream::pair().unwrap();
        (OwnedFd::from(a), OwnedFd::from(b))
    }

    #[test]
    fn pipe_read_only_rejects_write() {
        let (r, _w) = pipe();
        let mut stream = PipeStream::reader(r, 1).unwrap();
        let msg = Message::Data {
            handle: 1,
            payload: b"x".to_vec(),
        };
        assert!(matches!(
            stream.write(&msg),
            Err(Error::HalfDuplex { op: "write" })
        ));
    }

    #[test]
    fn pipe_write_only_rejects_read() {
        let (_r, w) = pipe();
        let mut stream = PipeStream::writer(w, 1).unwrap();
        assert!(matches!(
            stream.read(),
            Err(Error::HalfDuplex { op: "read" })
        ));
    }

    #[test]
    fn pipe_chunks_bytes_into_data() {
        let (r, w) = pipe();
        let mut reader = PipeStream::reader(r, 42).unwrap();
        let mut writer = PipeStream::writer(w, 42).unwrap();

        writer
            .write(&Message::Data {
                handle: 42,
                payload: b"hello".to_vec(),
            })
            .unwrap();

        match reader.read().unwrap() {
            ReadEvent::Message(Message::Data { handle, payload }) => {
                assert_eq!(handle, 42);
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn pipe_eof_after_writer_drop() {
        let (r, w) = pipe();
        let mut reader = PipeStream::reader(r, 1).unwrap();
        drop(PipeStream::writer(w, 1).unwrap());
        assert!(matches!(reader.read().unwrap(), ReadEvent::Eof));
    }

    #[test]
    fn idle_pipe_reads_incomplete_not_blocking() {
        let (r, _w) = pipe();
        let mut reader = PipeStream::reader(r, 1).unwrap();
        // Nothing written; a non-blocking read must return immediately.
        assert!(matches!(reader.read().unwrap(), ReadEvent::Incomplete));
    }

    #[test]
    fn broken_pipe_write_is_io_error() {
        let (r, w) = pipe();
        drop(PipeStream::reader(r, 1).unwrap());
        let mut writer = PipeStream::writer(w, 1).unwrap();
        let msg = Message::Data {
            handle: 1,
            payload: b"unread".to_vec(),
        };
        // SIGPIPE is not delivered under the test harness; write returns EPIPE.
        match writer.write(&msg) {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected broken pipe, got {other:?}"),
        }
    }

    #[test]
    fn full_pipe_queues_instead_of_blocking() {
        let (r, w) = pipe();
        let mut writer = PipeStream::writer(w, 1).unwrap();

        // Far more than any pipe buffer holds; the write call must return
        // with the overflow queued, not block.
        let payload = vec![0x5au8; 1 << 20];
        writer
            .write(&Message::Data {
                handle: 1,
                payload: payload.clone(),
            })
            .unwrap();
        assert!(writer.has_pending());

        let mut rx = File::from(r);
        let mut got = Vec::new();
        while got.len() < payload.len() {
            let mut chunk = vec![0u8; 64 * 1024];
            let n = rx.read(&mut chunk).unwrap();
            got.extend_from_slice(&chunk[..n]);
            writer.flush().unwrap();
        }
        assert!(!writer.has_pending());
        assert_eq!(got, payload);
    }

    #[test]
    fn socket_stream_is_full_duplex() {
        let (a, b) = socketpair_fds();
        let mut left = SocketStream::new(a, 5).unwrap();
        let mut right = SocketStream::new(b, 5).unwrap();

        left.write(&Message::Data {
            handle: 5,
            payload: b"ping".to_vec(),
        })
        .unwrap();
        right
            .write(&Message::Data {
                handle: 5,
                payload: b"pong".to_vec(),
            })
            .unwrap();

        match right.read().unwrap() {
            ReadEvent::Message(Message::Data { payload, .. }) => assert_eq!(payload, b"ping"),
            other => panic!("unexpected event: {other:?}"),
        }
        match left.read().unwrap() {
            ReadEvent::Message(Message::Data { payload, .. }) => assert_eq!(payload, b"pong"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn framed_stream_carries_whole_messages() {
        let (a, b) = socketpair_fds();
        let mut tx = FramedStream::new(a).unwrap();
        let mut rx = FramedStream::new(b).unwrap();

        let messages = vec![
            Message::Open {
                handle: 7,
                endpoint: vmux_proto::EndpointKind::Socket,
                cookie: "echo".into(),
            },
            Message::Data {
                handle: 7,
                payload: b"payload".to_vec(),
            },
            Message::Close { handle: 7 },
        ];
        for msg in &messages {
            tx.send(msg).unwrap();
        }

        let mut received = Vec::new();
        while received.len() < messages.len() {
            match rx.read().unwrap() {
                ReadEvent::Message(msg) => received.push(msg),
                ReadEvent::Incomplete => {}
                ReadEvent::Eof => panic!("premature eof"),
            }
        }
        assert_eq!(received, messages);
    }

    #[test]
    fn framed_stream_reports_clean_eof() {
        let (a, b) = socketpair_fds();
        drop(FramedStream::new(a).unwrap());
        let mut rx = FramedStream::new(b).unwrap();
        assert!(matches!(rx.read().unwrap(), ReadEvent::Eof));
    }

    #[test]
    fn framed_stream_rejects_truncated_frame() {
        let (a, b) = socketpair_fds();
        let mut rx = FramedStream::new(b).unwrap();

        // Write a header promising more bytes than ever arrive.
        let mut raw = File::from(a);
        raw.write_all(&8u32.to_be_bytes()).unwrap();
        raw.write_all(&[1, 2]).unwrap();
        drop(raw);

        // First reads buffer the partial frame, the final one hits EOF.
        loop {
            match rx.read() {
                Ok(ReadEvent::Incomplete) => {}
                Err(Error::Io(e)) => {
                    assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
                    break;
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }
}
