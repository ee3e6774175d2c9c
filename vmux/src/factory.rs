//! Default endpoint factory: cookies are Unix socket paths.

#![cfg(unix)]

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use tracing::debug;
use vmux_proto::EndpointKind;

use crate::error::Result;
use crate::fdpass;
use crate::mux::EndpointFactory;
use crate::stream::Stream;

/// Resolves `Open` cookies by connecting to the Unix-domain socket at that
/// path, regardless of the requested endpoint kind's duplexity.
///
/// This is the deployment used by `vmuxd`: services on each side listen on
/// well-known socket paths, and the peer names them in the open cookie.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixConnector;

impl EndpointFactory for UnixConnector {
    fn create(
        &mut self,
        endpoint: EndpointKind,
        cookie: &str,
        handle: u32,
    ) -> Result<Box<dyn Stream>> {
        debug!(handle, %cookie, "connecting local endpoint");
        let socket = UnixStream::connect(cookie)?;
        fdpass::wrap(OwnedFd::from(socket), endpoint, handle)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;

    use super::*;
    use crate::stream::ReadEvent;
    use vmux_proto::Message;

    #[test]
    fn connects_cookie_as_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut factory = UnixConnector;
        let mut stream = factory
            .create(EndpointKind::Socket, path.to_str().unwrap(), 3)
            .unwrap();

        let (mut accepted, _) = listener.accept().unwrap();
        accepted.write_all(b"hi").unwrap();
        match stream.read().unwrap() {
            ReadEvent::Message(Message::Data { handle, payload }) => {
                assert_eq!(handle, 3);
                assert_eq!(payload, b"hi");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        stream
            .write(&Message::Data {
                handle: 3,
                payload: b"yo".to_vec(),
            })
            .unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"yo");
    }

    #[test]
    fn missing_socket_fails_with_io_error() {
        let mut factory = UnixConnector;
        assert!(
            factory
                .create(EndpointKind::Socket, "/nonexistent/vmux.sock", 1)
                .is_err()
        );
    }
}
