mod common;

use std::pin::pin;

use stratum::{Backend, BackendConfig, BackendSelector, POLL_IN, ReactorHandle};

fn backend(name: &str) -> (std::rc::Rc<ReactorHandle>, Box<dyn Backend>) {
    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = BackendSelector::from_name(name)
        .create(reactor.clone())
        .unwrap();
    (reactor, backend)
}

/// Readiness arrives after data does.
fn readable_after_write(name: &str) {
    let (_reactor, backend) = backend(name);
    let (a, b) = common::socketpair();
    let state = backend.make_pollable_fd_state(a, 0);

    let mut readable = pin!(backend.readable(&state));
    assert!(common::poll_once(&mut readable).is_pending());

    b.write(b"ping").unwrap();
    let mut resolved = false;
    common::drive_until(&*backend, || {
        resolved = common::poll_once(&mut readable).is_ready();
        resolved
    });
    assert!(resolved);

    backend.forget(state);
}

/// Speculated readiness is consumed by the first wait and only the
/// first.
fn known_events_consume_once(name: &str) {
    let (_reactor, backend) = backend(name);
    let (a, _b) = common::socketpair();
    let state = backend.make_pollable_fd_state(a, POLL_IN);

    // First wait: readiness was speculated, resolve immediately.
    let mut first = pin!(backend.readable(&state));
    assert!(
        common::poll_once(&mut first).is_ready(),
        "speculated readiness resolves without a kernel round trip"
    );

    // Second wait: the speculation bit was consumed; with no data on the
    // socket this must suspend.
    let mut second = pin!(backend.readable(&state));
    assert!(common::poll_once(&mut second).is_pending());
    backend.kernel_submit_work();
    backend.reap_kernel_completions();
    assert!(common::poll_once(&mut second).is_pending());

    backend.forget(state);
}

/// A forget with a wait outstanding resolves the wait as aborted.
fn forget_aborts_pending_poll(name: &str) {
    let (_reactor, backend) = backend(name);
    let (a, b) = common::socketpair();
    let state = backend.make_pollable_fd_state(a, 0);

    let mut readable = pin!(backend.readable(&state));
    backend.kernel_submit_work();
    assert!(common::poll_once(&mut readable).is_pending());

    backend.forget(state);

    match common::poll_once(&mut readable) {
        std::task::Poll::Ready(Err(err)) => {
            assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
        }
        other => panic!("future must resolve as aborted, got {other:?}"),
    }

    drop(b);
}

#[test]
fn epoll_readable_after_write() {
    readable_after_write("epoll");
}

#[test]
fn epoll_known_events_consume_once() {
    known_events_consume_once("epoll");
}

#[test]
fn epoll_forget_aborts_pending_poll() {
    forget_aborts_pending_poll("epoll");
}

#[test]
fn aio_readable_after_write() {
    if !common::available_backends().contains(&"linux-aio") {
        eprintln!("linux-aio not available on this host, skipping");
        return;
    }
    readable_after_write("linux-aio");
}

#[test]
fn aio_known_events_consume_once() {
    if !common::available_backends().contains(&"linux-aio") {
        eprintln!("linux-aio not available on this host, skipping");
        return;
    }
    known_events_consume_once("linux-aio");
}

#[test]
fn aio_forget_aborts_pending_poll() {
    if !common::available_backends().contains(&"linux-aio") {
        eprintln!("linux-aio not available on this host, skipping");
        return;
    }
    forget_aborts_pending_poll("linux-aio");
}

#[cfg(feature = "uring")]
#[test]
fn uring_readable_after_write() {
    if !common::available_backends().contains(&"io_uring") {
        eprintln!("io_uring not available on this host, skipping");
        return;
    }
    readable_after_write("io_uring");
}

#[cfg(feature = "uring")]
#[test]
fn uring_known_events_consume_once() {
    if !common::available_backends().contains(&"io_uring") {
        eprintln!("io_uring not available on this host, skipping");
        return;
    }
    known_events_consume_once("io_uring");
}

#[cfg(feature = "uring")]
#[test]
fn uring_forget_aborts_pending_poll() {
    if !common::available_backends().contains(&"io_uring") {
        eprintln!("io_uring not available on this host, skipping");
        return;
    }
    forget_aborts_pending_poll("io_uring");
}
