//! Shared scaffolding for backend integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::ptr;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use stratum::{Backend, FileDesc};

/// A waker that does nothing; tests drive backends by hand.
pub fn noop_waker() -> Waker {
    const VTABLE: RawWakerVTable = RawWakerVTable::new(
        |_| RawWaker::new(ptr::null(), &VTABLE),
        |_| {},
        |_| {},
        |_| {},
    );
    unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &VTABLE)) }
}

pub fn poll_once<F: Future>(future: &mut Pin<&mut F>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    future.as_mut().poll(&mut cx)
}

/// Pumps submit/reap rounds until `done` reports true.
///
/// Panics after two seconds; a test that needs longer is broken.
pub fn drive_until(backend: &dyn Backend, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        backend.kernel_submit_work();
        backend.reap_kernel_completions();
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "backend made no progress");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A unique temp-file path for this test run.
pub fn temp_path(tag: &str) -> std::path::PathBuf {
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock drift")
        .as_nanos();
    std::env::temp_dir().join(format!("{}-{}-{}.tmp", tag, std::process::id(), unique))
}

/// A connected non-blocking unix socket pair.
pub fn socketpair() -> (FileDesc, FileDesc) {
    let mut fds = [0i32; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "socketpair failed");
    (FileDesc::from_raw(fds[0]), FileDesc::from_raw(fds[1]))
}

/// Names of the backends usable on this host.
pub fn available_backends() -> Vec<&'static str> {
    stratum::BackendSelector::available(1)
        .iter()
        .map(|b| b.name())
        .collect()
}
