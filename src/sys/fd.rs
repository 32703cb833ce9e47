//! Owned file descriptors.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use libc::{c_int, itimerspec};

/// An owned OS file descriptor, closed on drop.
///
/// `FileDesc` is deliberately not cloneable: every kernel handle in the
/// backend has exactly one owner.
pub struct FileDesc {
    fd: RawFd,
}

impl FileDesc {
    /// Takes ownership of an already-open descriptor.
    pub fn from_raw(fd: RawFd) -> Self {
        debug_assert!(fd >= 0);
        Self { fd }
    }

    /// Creates a `CLOCK_MONOTONIC` timerfd, non-blocking and close-on-exec.
    pub fn timerfd() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Creates a blocking `CLOCK_MONOTONIC` timerfd.
    ///
    /// Used for the task-quota timer, whose reader may want to block on
    /// the next expiry.
    pub fn timerfd_blocking() -> io::Result<Self> {
        let fd = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Creates an eventfd with the given initial value.
    pub fn eventfd(initial: u32) -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(initial, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Creates an epoll instance.
    pub fn epoll() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buffer.as_mut_ptr() as *mut _, buffer.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn write(&self, buffer: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buffer.as_ptr() as *const _, buffer.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Drains an 8-byte timerfd/eventfd counter, ignoring `EAGAIN`.
    pub(crate) fn drain_counter(&self) -> u64 {
        let mut buf = [0u8; 8];
        match self.read(&mut buf) {
            Ok(8) => u64::from_ne_bytes(buf),
            _ => 0,
        }
    }

    /// Arms the timer with an absolute `CLOCK_MONOTONIC` deadline.
    pub fn timerfd_settime_abs(&self, its: &itimerspec) -> io::Result<()> {
        let rc = unsafe {
            libc::timerfd_settime(self.fd, libc::TFD_TIMER_ABSTIME, its, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Arms the timer relative to now.
    pub fn timerfd_settime_rel(&self, its: &itimerspec) -> io::Result<()> {
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, its, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Switches the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn shutdown(&self, how: c_int) -> io::Result<()> {
        let rc = unsafe { libc::shutdown(self.fd, how) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl std::fmt::Debug for FileDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FileDesc").field(&self.fd).finish()
    }
}

/// Arms a timerfd (by raw handle) with an absolute deadline.
pub(crate) fn timerfd_settime_abs_raw(fd: RawFd, its: &itimerspec) -> io::Result<()> {
    let rc =
        unsafe { libc::timerfd_settime(fd, libc::TFD_TIMER_ABSTIME, its, std::ptr::null_mut()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Builds an `itimerspec` that fires once at the given value; whether
/// the value is absolute or relative is decided when it is armed.
pub(crate) fn one_shot_itimerspec(secs: i64, nanos: i64) -> itimerspec {
    let mut its: itimerspec = unsafe { mem::zeroed() };
    its.it_value.tv_sec = secs;
    its.it_value.tv_nsec = nanos;
    its
}

/// Builds a periodic `itimerspec` with the given initial delay and period.
pub(crate) fn periodic_itimerspec(delay_ns: i64, period_ns: i64) -> itimerspec {
    let mut its: itimerspec = unsafe { mem::zeroed() };
    its.it_value.tv_sec = delay_ns / 1_000_000_000;
    its.it_value.tv_nsec = delay_ns % 1_000_000_000;
    its.it_interval.tv_sec = period_ns / 1_000_000_000;
    its.it_interval.tv_nsec = period_ns % 1_000_000_000;
    its
}

/// True when the itimerspec is disarmed (all-zero value).
pub(crate) fn itimerspec_is_zero(its: &itimerspec) -> bool {
    its.it_value.tv_sec == 0 && its.it_value.tv_nsec == 0
}
