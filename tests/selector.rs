use stratum::{BackendConfig, BackendSelector, ReactorHandle};

#[test]
fn epoll_is_always_offered() {
    let available = BackendSelector::available(1);
    assert!(!available.is_empty());
    assert!(available.iter().any(|b| b.name() == "epoll"));
}

#[test]
fn default_backend_is_first_available() {
    let available = BackendSelector::available(1);
    assert_eq!(BackendSelector::default_backend(1), available[0]);
}

#[test]
fn known_tags_resolve() {
    assert_eq!(BackendSelector::from_name("epoll").name(), "epoll");
    assert_eq!(BackendSelector::from_name("linux-aio").name(), "linux-aio");
    assert_eq!(BackendSelector::from_name("io_uring").name(), "io_uring");
}

#[test]
#[should_panic(expected = "bad reactor backend")]
fn unknown_tag_is_a_logic_error() {
    BackendSelector::from_name("kqueue");
}

#[test]
fn epoll_backend_constructs() {
    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = BackendSelector::from_name("epoll").create(reactor);
    assert!(backend.is_ok());
}

/// An absurd shard count cannot be satisfied by the system-wide AIO
/// budget, so linux-aio must not be offered for it.
#[test]
fn aio_headroom_gates_linux_aio() {
    let available = BackendSelector::available(usize::MAX / (4 * 256));
    assert!(!available.iter().any(|b| b.name() == "linux-aio"));
    assert!(available.iter().any(|b| b.name() == "epoll"));
}

#[cfg(not(feature = "uring"))]
#[test]
fn uring_without_feature_is_a_runtime_error() {
    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let result = BackendSelector::from_name("io_uring").create(reactor);
    assert!(result.is_err());
}
