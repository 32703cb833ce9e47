//! High-level socket operations over a backend.
//!
//! These helpers pair the non-blocking syscall with the matching
//! readiness wait, so callers get a single awaitable operation. The
//! descriptors involved must be non-blocking.

use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::pollable::PollableFdState;
use crate::sys::net;
use crate::sys::fd::FileDesc;

use super::{Backend, state_fd};

/// Accepts one connection from a listening socket.
///
/// Waits on both directions: a peer `shutdown` reports its error through
/// writeability, and the wait must observe either.
pub async fn accept(
    backend: &dyn Backend,
    listenfd: &Rc<PollableFdState>,
) -> io::Result<(FileDesc, SocketAddr)> {
    loop {
        match net::sys_accept(state_fd(listenfd)) {
            Ok((fd, addr)) => return Ok((FileDesc::from_raw(fd), addr)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                backend.readable_or_writeable(listenfd).await?;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Connects a non-blocking socket to `addr`.
pub async fn connect(
    backend: &dyn Backend,
    fd: &Rc<PollableFdState>,
    addr: &SocketAddr,
) -> io::Result<()> {
    match net::sys_connect(state_fd(fd), addr) {
        // Connected immediately (possible on localhost).
        Ok(()) => Ok(()),
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EINPROGRESS) =>
        {
            backend.writeable(fd).await?;
            net::sys_get_socket_error(state_fd(fd))
        }
        Err(err) => Err(err),
    }
}

/// Reads whatever is available, waiting for readability when nothing is.
pub async fn read_some(
    backend: &dyn Backend,
    fd: &Rc<PollableFdState>,
    buffer: &mut [u8],
) -> io::Result<usize> {
    loop {
        let n = net::sys_read(state_fd(fd), buffer);
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => {
                backend.readable(fd).await?;
            }
            io::ErrorKind::Interrupted => {}
            _ => return Err(err),
        }
    }
}

/// Writes from the buffer, waiting for writeability when the socket is
/// full. Returns after the first successful write; callers loop for
/// write-all semantics.
pub async fn write_some(
    backend: &dyn Backend,
    fd: &Rc<PollableFdState>,
    buffer: &[u8],
) -> io::Result<usize> {
    loop {
        let n = net::sys_write(state_fd(fd), buffer);
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => {
                backend.writeable(fd).await?;
            }
            io::ErrorKind::Interrupted => {}
            _ => return Err(err),
        }
    }
}
