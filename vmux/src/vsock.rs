//! Raw `AF_VSOCK` transport boundary.
//!
//! The dispatcher treats vsock as nothing more than "connect and accept
//! produce a reliable ordered byte stream"; this module is the only place
//! that knows the address format. All `unsafe` in the crate is confined
//! here.

#![cfg(target_os = "linux")]
#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Well-known CID of the host, from the guest's perspective.
pub const HOST_CID: u32 = libc::VMADDR_CID_HOST;

/// Creates a vsock listener bound to `port` on any CID.
pub fn listen(port: u32) -> io::Result<OwnedFd> {
    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = OwnedFd::from_raw_fd(fd);

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as u16;
        addr.svm_cid = libc::VMADDR_CID_ANY;
        addr.svm_port = port;

        if libc::bind(
            sock.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        if libc::listen(sock.as_raw_fd(), 8) < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(sock)
    }
}

/// Accepts one connection from a vsock listener.
pub fn accept(listener: &OwnedFd) -> io::Result<OwnedFd> {
    unsafe {
        let fd = libc::accept(
            listener.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

/// Connects to `port` on the peer with context id `cid`.
pub fn connect(cid: u32, port: u32) -> io::Result<OwnedFd> {
    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = OwnedFd::from_raw_fd(fd);

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as u16;
        addr.svm_cid = cid;
        addr.svm_port = port;

        if libc::connect(
            sock.as_raw_fd(),
            std::ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok(sock)
    }
}
