//! Kernel-facing plumbing.
//!
//! Everything that talks to Linux directly lives here: the raw AIO ABI,
//! owned file descriptors, and the thin socket syscall wrappers used by the
//! high-level I/O helpers. The rest of the crate never calls `libc`
//! directly for I/O.

pub(crate) mod aio;
pub(crate) mod fd;
pub(crate) mod net;

/// Readiness bit for "readable", shared by the poll and epoll interfaces
/// (the kernel uses the same values for both).
pub const POLL_IN: u32 = libc::POLLIN as u32;

/// Readiness bit for "writeable".
pub const POLL_OUT: u32 = libc::POLLOUT as u32;

pub(crate) const POLL_ERR: u32 = libc::POLLERR as u32;
pub(crate) const POLL_HUP: u32 = libc::POLLHUP as u32;
