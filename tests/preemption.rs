mod common;

use std::time::{Duration, Instant};

use stratum::{Backend, BackendConfig, BackendSelector, ReactorHandle, need_preempt};

/// request_preemption makes need_preempt read true on this shard within
/// a bounded wait, and reset_preemption_monitor clears it again.
fn preemption_fires(name: &str, uses_helper_thread: bool) {
    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = BackendSelector::from_name(name)
        .create(reactor.clone())
        .unwrap();

    if !uses_helper_thread {
        // The AIO-ring monitor only counts once ticking has started.
        backend.start_tick();
    }
    backend.reset_preemption_monitor();
    assert!(!need_preempt(), "fresh monitor must be clear");

    let started = Instant::now();
    backend.request_preemption();
    assert!(need_preempt(), "preemption visible after request");
    assert!(
        started.elapsed() < Duration::from_millis(10),
        "preemption must assert within the bound"
    );

    backend.reset_preemption_monitor();
    assert!(!need_preempt(), "reset clears the monitor");

    if !uses_helper_thread {
        backend.stop_tick();
        assert!(!need_preempt(), "software monitor clear after stop_tick");
    }
}

#[test]
fn epoll_preemption_fires() {
    preemption_fires("epoll", true);
}

#[test]
fn aio_preemption_fires() {
    if !common::available_backends().contains(&"linux-aio") {
        eprintln!("linux-aio not available on this host, skipping");
        return;
    }
    preemption_fires("linux-aio", false);
}

#[cfg(feature = "uring")]
#[test]
fn uring_preemption_fires() {
    if !common::available_backends().contains(&"io_uring") {
        eprintln!("io_uring not available on this host, skipping");
        return;
    }
    preemption_fires("io_uring", false);
}

/// The epoll helper thread ticks the quota timer and can be shut down.
#[test]
fn epoll_tick_thread_starts_and_stops() {
    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = BackendSelector::from_name("epoll")
        .create(reactor.clone())
        .unwrap();

    backend.start_tick();
    // stop_tick arms the quota timer itself, so this must return even if
    // the reactor never armed it.
    backend.stop_tick();
}

/// A busy loop in task position observes the flag set by a sibling code
/// path, the shape preemption takes in production.
#[test]
fn busy_loop_observes_preemption() {
    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = BackendSelector::from_name("epoll")
        .create(reactor.clone())
        .unwrap();

    backend.reset_preemption_monitor();
    let mut iterations = 0u64;
    let deadline = Instant::now() + Duration::from_millis(10);
    while !need_preempt() {
        iterations += 1;
        if iterations == 1000 {
            backend.request_preemption();
        }
        assert!(Instant::now() < deadline, "loop never observed preemption");
    }
    assert!(iterations >= 1000);
}
