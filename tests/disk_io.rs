mod common;

use std::cell::Cell;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use stratum::{BackendConfig, BackendSelector, IoRequest, ReactorHandle};

/// 4 KiB of known content, read back through a backend's storage path.
fn disk_read_round_trip(selector: BackendSelector) {
    let path = common::temp_path(&format!("disk-read-{}", selector.name()));
    let content = vec![0xabu8; 4096];
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&content).unwrap();
    file.sync_all().unwrap();

    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = selector.create(reactor.clone()).unwrap();

    let file = std::fs::File::open(&path).unwrap();
    let mut buffer = vec![0u8; 4096];
    let result = Rc::new(Cell::new(None));

    let observed = result.clone();
    let request =
        unsafe { IoRequest::read(file.as_raw_fd(), 0, buffer.as_mut_ptr(), buffer.len(), false) };
    reactor.submit_io(request, move |res| observed.set(Some(res)));

    common::drive_until(&*backend, || result.get().is_some());

    assert_eq!(result.get(), Some(4096), "full read completes");
    assert_eq!(buffer, content, "buffer holds the file content");
    assert_eq!(reactor.io_stats().aio_errors(), 0);

    let _ = std::fs::remove_file(&path);
}

/// A write followed by fdatasync, then read back through std.
fn disk_write_round_trip(selector: BackendSelector) {
    let path = common::temp_path(&format!("disk-write-{}", selector.name()));
    std::fs::File::create(&path).unwrap();

    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = selector.create(reactor.clone()).unwrap();

    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    let buffer = vec![0x17u8; 4096];

    let written = Rc::new(Cell::new(None));
    let observed = written.clone();
    let request =
        unsafe { IoRequest::write(file.as_raw_fd(), 0, buffer.as_ptr(), buffer.len(), false) };
    reactor.submit_io(request, move |res| observed.set(Some(res)));
    common::drive_until(&*backend, || written.get().is_some());
    assert_eq!(written.get(), Some(4096));

    let synced = Rc::new(Cell::new(None));
    let observed = synced.clone();
    reactor.submit_io(IoRequest::fdatasync(file.as_raw_fd()), move |res| {
        observed.set(Some(res))
    });
    common::drive_until(&*backend, || synced.get().is_some());
    assert_eq!(synced.get(), Some(0), "fdatasync reports success");

    assert_eq!(std::fs::read(&path).unwrap(), buffer);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn epoll_disk_read_round_trip() {
    disk_read_round_trip(BackendSelector::from_name("epoll"));
}

#[test]
fn epoll_disk_write_round_trip() {
    disk_write_round_trip(BackendSelector::from_name("epoll"));
}

#[test]
fn aio_disk_read_round_trip() {
    if !common::available_backends().contains(&"linux-aio") {
        eprintln!("linux-aio not available on this host, skipping");
        return;
    }
    disk_read_round_trip(BackendSelector::from_name("linux-aio"));
}

#[test]
fn aio_disk_write_round_trip() {
    if !common::available_backends().contains(&"linux-aio") {
        eprintln!("linux-aio not available on this host, skipping");
        return;
    }
    disk_write_round_trip(BackendSelector::from_name("linux-aio"));
}

#[cfg(feature = "uring")]
#[test]
fn uring_disk_read_round_trip() {
    if !common::available_backends().contains(&"io_uring") {
        eprintln!("io_uring not available on this host, skipping");
        return;
    }
    disk_read_round_trip(BackendSelector::from_name("io_uring"));
}

#[cfg(feature = "uring")]
#[test]
fn uring_disk_write_round_trip() {
    if !common::available_backends().contains(&"io_uring") {
        eprintln!("io_uring not available on this host, skipping");
        return;
    }
    disk_write_round_trip(BackendSelector::from_name("io_uring"));
}

/// Many reads in flight at once stay within the pool bound and all
/// complete exactly once.
#[test]
fn many_concurrent_reads_complete_once() {
    let path = common::temp_path("disk-many");
    let content: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&content).unwrap();
    file.sync_all().unwrap();

    let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
    let backend = BackendSelector::from_name("epoll")
        .create(reactor.clone())
        .unwrap();

    let file = std::fs::File::open(&path).unwrap();
    const CHUNK: usize = 4096;
    let chunks = content.len() / CHUNK;
    let mut buffers: Vec<Vec<u8>> = (0..chunks).map(|_| vec![0u8; CHUNK]).collect();
    let completions = Rc::new(Cell::new(0usize));

    for (i, buffer) in buffers.iter_mut().enumerate() {
        let observed = completions.clone();
        let request = unsafe {
            IoRequest::read(
                file.as_raw_fd(),
                (i * CHUNK) as u64,
                buffer.as_mut_ptr(),
                CHUNK,
                false,
            )
        };
        reactor.submit_io(request, move |res| {
            assert_eq!(res, CHUNK as isize);
            observed.set(observed.get() + 1);
        });
    }

    common::drive_until(&*backend, || completions.get() == chunks);

    for (i, buffer) in buffers.iter().enumerate() {
        assert_eq!(buffer[..], content[i * CHUNK..(i + 1) * CHUNK]);
    }

    let _ = std::fs::remove_file(&path);
}
