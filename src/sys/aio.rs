//! Raw Linux AIO ABI.
//!
//! `libc` does not expose the native AIO interface, so the control block
//! and event layouts are mirrored here and the syscalls are issued through
//! `libc::syscall`. Field order matches the little-endian kernel layout.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use libc::{c_long, sigset_t, timespec};

/// Kernel AIO context handle, as returned by `io_setup(2)`.
///
/// On Linux this is the userspace address of the context's mapped
/// `aio_ring` header, which the preemption machinery exploits.
pub(crate) type AioContext = libc::c_ulong;

pub(crate) const IOCB_CMD_PREAD: u16 = 0;
pub(crate) const IOCB_CMD_PWRITE: u16 = 1;
pub(crate) const IOCB_CMD_FDSYNC: u16 = 3;
pub(crate) const IOCB_CMD_POLL: u16 = 5;
pub(crate) const IOCB_CMD_PREADV: u16 = 7;
pub(crate) const IOCB_CMD_PWRITEV: u16 = 8;

/// `aio_resfd` carries an eventfd to signal on completion.
const IOCB_FLAG_RESFD: u32 = 1;

/// Per-request `RWF_NOWAIT`, applied through `aio_rw_flags`.
const RWF_NOWAIT: i32 = 0x0000_0008;

/// Kernel I/O control block (`struct iocb`).
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Iocb {
    pub(crate) aio_data: u64,
    aio_key: u32,
    aio_rw_flags: i32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

impl Iocb {
    pub(crate) const fn zeroed() -> Self {
        Self {
            aio_data: 0,
            aio_key: 0,
            aio_rw_flags: 0,
            aio_lio_opcode: 0,
            aio_reqprio: 0,
            aio_fildes: 0,
            aio_buf: 0,
            aio_nbytes: 0,
            aio_offset: 0,
            aio_reserved2: 0,
            aio_flags: 0,
            aio_resfd: 0,
        }
    }
}

/// Completion record delivered by `io_getevents(2)`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IoEvent {
    /// The `aio_data` of the completed iocb.
    pub(crate) data: u64,
    /// Address of the completed iocb.
    pub(crate) obj: u64,
    /// Signed result: bytes transferred, or `-errno`.
    pub(crate) res: i64,
    pub(crate) res2: i64,
}

impl IoEvent {
    pub(crate) const fn zeroed() -> Self {
        Self {
            data: 0,
            obj: 0,
            res: 0,
            res2: 0,
        }
    }
}

/// Header of the kernel-mapped completion ring (`struct aio_ring`).
///
/// The kernel advances `tail` when it posts an event; userspace advances
/// `head` as it consumes them. A context handle points at this header.
#[repr(C)]
struct AioRing {
    id: u32,
    nr: u32,
    head: AtomicU32,
    tail: AtomicU32,
    magic: u32,
    compat_features: u32,
    incompat_features: u32,
    header_length: u32,
}

const AIO_RING_MAGIC: u32 = 0xa10a_10a1;

/// Byte offset of the ring's `head`/`tail` counter pair within the header.
pub(crate) const AIO_RING_COUNTER_OFFSET: usize = 8;

fn make_iocb(opcode: u16, fd: i32) -> Iocb {
    let mut iocb = Iocb::zeroed();
    iocb.aio_lio_opcode = opcode;
    iocb.aio_fildes = fd as u32;
    iocb
}

pub(crate) fn make_read_iocb(fd: i32, pos: u64, buf: *mut u8, len: usize) -> Iocb {
    let mut iocb = make_iocb(IOCB_CMD_PREAD, fd);
    iocb.aio_buf = buf as u64;
    iocb.aio_nbytes = len as u64;
    iocb.aio_offset = pos as i64;
    iocb
}

pub(crate) fn make_write_iocb(fd: i32, pos: u64, buf: *const u8, len: usize) -> Iocb {
    let mut iocb = make_iocb(IOCB_CMD_PWRITE, fd);
    iocb.aio_buf = buf as u64;
    iocb.aio_nbytes = len as u64;
    iocb.aio_offset = pos as i64;
    iocb
}

pub(crate) fn make_readv_iocb(fd: i32, pos: u64, iov: *const libc::iovec, iov_len: usize) -> Iocb {
    let mut iocb = make_iocb(IOCB_CMD_PREADV, fd);
    iocb.aio_buf = iov as u64;
    iocb.aio_nbytes = iov_len as u64;
    iocb.aio_offset = pos as i64;
    iocb
}

pub(crate) fn make_writev_iocb(fd: i32, pos: u64, iov: *const libc::iovec, iov_len: usize) -> Iocb {
    let mut iocb = make_iocb(IOCB_CMD_PWRITEV, fd);
    iocb.aio_buf = iov as u64;
    iocb.aio_nbytes = iov_len as u64;
    iocb.aio_offset = pos as i64;
    iocb
}

pub(crate) fn make_fdsync_iocb(fd: i32) -> Iocb {
    make_iocb(IOCB_CMD_FDSYNC, fd)
}

/// Builds a one-shot readiness poll (`IOCB_CMD_POLL`); `events` is a
/// `POLL_IN`/`POLL_OUT` mask carried in `aio_buf`.
pub(crate) fn make_poll_iocb(fd: i32, events: u32) -> Iocb {
    let mut iocb = make_iocb(IOCB_CMD_POLL, fd);
    iocb.aio_buf = events as u64;
    iocb
}

pub(crate) fn set_user_data(iocb: &mut Iocb, user_data: *const ()) {
    iocb.aio_data = user_data as u64;
}

pub(crate) fn set_nowait(iocb: &mut Iocb, nowait: bool) {
    if nowait {
        iocb.aio_rw_flags |= RWF_NOWAIT;
    } else {
        iocb.aio_rw_flags &= !RWF_NOWAIT;
    }
}

/// Requests an eventfd signal when this iocb completes, so a sleeping
/// reactor is woken without polling.
pub(crate) fn set_eventfd_notification(iocb: &mut Iocb, eventfd: i32) {
    iocb.aio_flags |= IOCB_FLAG_RESFD;
    iocb.aio_resfd = eventfd as u32;
}

/// Creates an AIO context able to hold `nr_events` concurrent requests.
pub(crate) fn io_setup(nr_events: usize, ctx: &mut AioContext) -> io::Result<()> {
    let r = unsafe { libc::syscall(libc::SYS_io_setup, nr_events as libc::c_ulong, ctx) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn io_destroy(ctx: AioContext) {
    unsafe {
        libc::syscall(libc::SYS_io_destroy, ctx);
    }
}

/// Submits a batch of iocbs; returns how many the kernel accepted.
pub(crate) fn io_submit(ctx: AioContext, iocbs: &mut [*mut Iocb]) -> io::Result<usize> {
    if iocbs.is_empty() {
        return Ok(0);
    }
    let r = unsafe {
        libc::syscall(
            libc::SYS_io_submit,
            ctx,
            iocbs.len() as c_long,
            iocbs.as_mut_ptr(),
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r as usize)
}

pub(crate) fn io_cancel(ctx: AioContext, iocb: *mut Iocb) -> io::Result<()> {
    let mut result = IoEvent::zeroed();
    let r = unsafe { libc::syscall(libc::SYS_io_cancel, ctx, iocb, &mut result) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking reap of available events.
///
/// When the context's completion ring is mapped sanely this reads it
/// directly and skips the syscall; `force_syscall` disables the userspace
/// path (some seccomp environments behave differently for the two).
pub(crate) fn io_getevents(
    ctx: AioContext,
    events: &mut [IoEvent],
    force_syscall: bool,
) -> io::Result<usize> {
    if !force_syscall {
        if let Some(n) = try_reap_ring(ctx, events) {
            return Ok(n);
        }
    }
    let mut timeout = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let r = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            1 as c_long,
            events.len() as c_long,
            events.as_mut_ptr(),
            &mut timeout,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r as usize)
}

/// Drains completed events straight out of the mapped ring.
///
/// Returns `None` when the ring cannot be consumed from userspace and the
/// caller must fall back to the syscall.
fn try_reap_ring(ctx: AioContext, events: &mut [IoEvent]) -> Option<usize> {
    let ring = ctx as *const AioRing;
    unsafe {
        if (*ring).magic != AIO_RING_MAGIC || (*ring).incompat_features != 0 {
            return None;
        }
        let nr = (*ring).nr;
        let mut head = (*ring).head.load(Ordering::Relaxed);
        let tail = (*ring).tail.load(Ordering::Acquire);
        let ring_events =
            (ring as *const u8).add((*ring).header_length as usize) as *const IoEvent;
        let mut reaped = 0;
        while head != tail && reaped < events.len() {
            events[reaped] = ptr::read_volatile(ring_events.add((head % nr) as usize));
            head = head.wrapping_add(1);
            reaped += 1;
        }
        if reaped > 0 {
            (*ring).head.store(head, Ordering::Release);
        }
        Some(reaped)
    }
}

#[repr(C)]
struct AioSigset {
    sigmask: *const sigset_t,
    sigsetsize: usize,
}

/// The kernel's sigset is 8 bytes, not glibc's 128.
const KERNEL_SIGSET_SIZE: usize = 8;

/// `libc` doesn't expose this syscall number for the gnu/x86_64 target;
/// the value matches the kernel's `io_pgetevents` syscall (333 on x86_64).
#[cfg(target_arch = "x86_64")]
const SYS_IO_PGETEVENTS: c_long = 333;

/// Waits for at least `min_nr` events, optionally bounded by `timeout` and
/// with `sigmask` atomically installed for the duration of the wait.
pub(crate) fn io_pgetevents(
    ctx: AioContext,
    min_nr: usize,
    events: &mut [IoEvent],
    timeout: Option<&timespec>,
    sigmask: Option<&sigset_t>,
) -> io::Result<usize> {
    let usig = AioSigset {
        sigmask: sigmask.map_or(ptr::null(), |s| s as *const sigset_t),
        sigsetsize: KERNEL_SIGSET_SIZE,
    };
    let r = unsafe {
        libc::syscall(
            SYS_IO_PGETEVENTS,
            ctx,
            min_nr as c_long,
            events.len() as c_long,
            events.as_mut_ptr(),
            timeout.map_or(ptr::null(), |t| t as *const timespec),
            &usig,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn iocb_layout_matches_kernel_abi() {
        assert_eq!(mem::size_of::<Iocb>(), 64, "struct iocb is 64 bytes");
        assert_eq!(mem::size_of::<IoEvent>(), 32, "struct io_event is 32 bytes");
    }

    #[test]
    fn read_iocb_fields() {
        let mut buf = [0u8; 16];
        let mut iocb = make_read_iocb(7, 4096, buf.as_mut_ptr(), buf.len());
        assert_eq!(iocb.aio_lio_opcode, IOCB_CMD_PREAD);
        assert_eq!(iocb.aio_fildes, 7);
        assert_eq!(iocb.aio_offset, 4096);
        assert_eq!(iocb.aio_nbytes, 16);

        set_nowait(&mut iocb, true);
        assert_eq!(iocb.aio_rw_flags & RWF_NOWAIT, RWF_NOWAIT);
        set_nowait(&mut iocb, false);
        assert_eq!(iocb.aio_rw_flags & RWF_NOWAIT, 0);
    }

    #[test]
    fn poll_iocb_carries_event_mask() {
        let iocb = make_poll_iocb(3, crate::sys::POLL_IN | crate::sys::POLL_OUT);
        assert_eq!(iocb.aio_lio_opcode, IOCB_CMD_POLL);
        assert_eq!(
            iocb.aio_buf,
            (crate::sys::POLL_IN | crate::sys::POLL_OUT) as u64
        );
    }

    #[test]
    fn eventfd_notification_sets_resfd() {
        let mut iocb = make_fdsync_iocb(5);
        set_eventfd_notification(&mut iocb, 9);
        assert_eq!(iocb.aio_flags & IOCB_FLAG_RESFD, IOCB_FLAG_RESFD);
        assert_eq!(iocb.aio_resfd, 9);
    }
}
