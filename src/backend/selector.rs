//! Backend capability detection and construction.

use std::io;
use std::rc::Rc;

use crate::aio::MAX_AIO;
use crate::shard::ReactorHandle;
use crate::sys;
use crate::sys::aio::{self, AioContext, IoEvent, Iocb};
use crate::sys::fd::FileDesc;

use super::{AioBackend, Backend, EpollBackend};

/// Names one backend implementation and knows how to construct it.
///
/// Obtain instances from [`available`](Self::available) (capability
/// detection) or [`from_name`](Self::from_name) (explicit configuration).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BackendSelector {
    name: &'static str,
}

impl BackendSelector {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Resolves a configuration tag.
    ///
    /// # Panics
    ///
    /// Panics on an unknown tag; accepting one would be a logic error in
    /// the caller's configuration handling, not a runtime condition.
    pub fn from_name(name: &str) -> Self {
        match name {
            "linux-aio" => Self { name: "linux-aio" },
            "epoll" => Self { name: "epoll" },
            "io_uring" => Self { name: "io_uring" },
            _ => panic!("bad reactor backend: {name}"),
        }
    }

    /// Constructs the selected backend for one shard.
    pub fn create(&self, reactor: Rc<ReactorHandle>) -> io::Result<Box<dyn Backend>> {
        match self.name {
            "io_uring" => {
                #[cfg(feature = "uring")]
                {
                    Ok(Box::new(super::UringBackend::new(reactor)?))
                }
                #[cfg(not(feature = "uring"))]
                {
                    let _ = reactor;
                    Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "io_uring backend not compiled in",
                    ))
                }
            }
            "linux-aio" => Ok(Box::new(AioBackend::new(reactor)?)),
            "epoll" => Ok(Box::new(EpollBackend::new(reactor)?)),
            _ => unreachable!(),
        }
    }

    /// Backends usable on this host, in preference order.
    ///
    /// `epoll` is always present; `linux-aio` needs enough system-wide
    /// AIO headroom for every shard plus working fd polling; `io_uring`
    /// needs a ring with the required features and opcodes.
    pub fn available(nr_shards: usize) -> Vec<BackendSelector> {
        let mut ret = Vec::new();
        if has_enough_aio_nr(nr_shards) && detect_aio_poll() {
            ret.push(Self { name: "linux-aio" });
        }
        ret.push(Self { name: "epoll" });
        #[cfg(feature = "uring")]
        if detect_io_uring() {
            ret.push(Self { name: "io_uring" });
        }
        ret
    }

    /// The first available backend.
    pub fn default_backend(nr_shards: usize) -> BackendSelector {
        Self::available(nr_shards)[0]
    }
}

fn read_first_line_as_u64(path: &str) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.lines().next()?.trim().parse().ok()
}

/// Checks the system-wide AIO budget before any context is set up:
/// available slots must cover `MAX_AIO` for every shard.
fn has_enough_aio_nr(nr_shards: usize) -> bool {
    let Some(aio_max_nr) = read_first_line_as_u64("/proc/sys/fs/aio-max-nr") else {
        return false;
    };
    let Some(aio_nr) = read_first_line_as_u64("/proc/sys/fs/aio-nr") else {
        return false;
    };
    aio_max_nr.saturating_sub(aio_nr) >= (MAX_AIO * nr_shards) as u64
}

/// Smoke test for `IOCB_CMD_POLL` plus `io_pgetevents`.
///
/// The two ship together in mainline kernels, but some container
/// runtimes whitelist one syscall and not the other, so the probe always
/// exercises the real `io_pgetevents` syscall.
fn detect_aio_poll() -> bool {
    let Ok(eventfd) = FileDesc::eventfd(0) else {
        return false;
    };
    let mut ctx: AioContext = 0;
    if aio::io_setup(1, &mut ctx).is_err() {
        return false;
    }

    let mut iocb = aio::make_poll_iocb(eventfd.raw(), sys::POLL_IN | sys::POLL_OUT);
    let mut batch = [&mut iocb as *mut Iocb];
    let detected = match aio::io_submit(ctx, &mut batch) {
        Ok(1) => {
            let _ = eventfd.write(&1u64.to_ne_bytes());
            let mut events = [IoEvent::zeroed(); 1];
            matches!(aio::io_pgetevents(ctx, 1, &mut events, None, None), Ok(1))
        }
        _ => false,
    };

    aio::io_destroy(ctx);
    detected
}

#[cfg(feature = "uring")]
fn detect_io_uring() -> bool {
    // Kernels before 5.17 fall back to workqueues for RAID devices,
    // which defeats the point of the ring.
    if !kernel_version_at_least(5, 17) && have_md_devices() {
        return false;
    }
    super::uring::try_create_uring(1).is_ok()
}

#[cfg(feature = "uring")]
fn have_md_devices() -> bool {
    let Ok(entries) = std::fs::read_dir("/sys/block") else {
        return false;
    };
    for entry in entries.flatten() {
        if entry.path().join("md").exists() {
            return true;
        }
    }
    false
}

#[cfg(feature = "uring")]
fn kernel_version_at_least(major: u32, minor: u32) -> bool {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return false;
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    let Ok(release) = release.to_str() else {
        return false;
    };
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let maj: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let min: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (maj, min) >= (major, minor)
}
