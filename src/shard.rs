//! Reactor-side collaborators.
//!
//! The backend layer does not own the event loop; it serves one. This
//! module holds the surface the surrounding reactor exposes to its
//! backend: the I/O sink the scheduler fills with disk requests, the
//! off-reactor worker pool, and the per-shard kernel objects and flags
//! the backends read and write.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::completion::Completion;
use crate::preempt::{self, PreemptionMonitor};
use crate::request::IoRequest;
use crate::sys::fd::FileDesc;

/// Runs jobs on worker threads, off the reactor's CPU.
///
/// The storage retry path uses this to issue `io_submit` calls that would
/// otherwise block the shard when the kernel page cache is in play.
pub trait ThreadPool {
    fn submit(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Fallback pool spawning one short-lived thread per job.
///
/// Suitable for tests and for embedders without a shared worker pool; the
/// retry path issues jobs rarely.
pub struct SpawningThreadPool;

impl ThreadPool for SpawningThreadPool {
    fn submit(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        std::thread::spawn(job);
    }
}

/// Queue of disk I/O requests awaiting submission to the kernel.
///
/// The scheduler pushes pairs of request and completion; the active
/// backend drains them in `kernel_submit_work`.
pub struct IoSink {
    queue: RefCell<VecDeque<(IoRequest, Rc<Completion>)>>,
}

impl IoSink {
    fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub fn submit(&self, request: IoRequest, completion: Rc<Completion>) {
        self.queue.borrow_mut().push_back((request, completion));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    /// Hands queued requests to `f` in FIFO order.
    ///
    /// `f` either consumes the pair or gives it back; a returned pair is
    /// requeued at the front and draining stops (the backend ran out of
    /// submission capacity). Returns how many pairs were consumed.
    pub(crate) fn drain<F>(&self, mut f: F) -> usize
    where
        F: FnMut(IoRequest, Rc<Completion>) -> Result<(), (IoRequest, Rc<Completion>)>,
    {
        let mut consumed = 0;
        loop {
            let entry = self.queue.borrow_mut().pop_front();
            let Some((request, completion)) = entry else {
                return consumed;
            };
            match f(request, completion) {
                Ok(()) => consumed += 1,
                Err(entry) => {
                    self.queue.borrow_mut().push_front(entry);
                    return consumed;
                }
            }
        }
    }
}

/// Counters the backends update as they work.
pub struct IoStats {
    aio_errors: Cell<u64>,
}

impl IoStats {
    pub fn aio_errors(&self) -> u64 {
        self.aio_errors.get()
    }

    pub(crate) fn count_aio_error(&self) {
        self.aio_errors.set(self.aio_errors.get() + 1);
    }
}

/// Shard state shared with the epoll backend's timer helper thread.
///
/// This is the only reactor memory that thread may touch; everything in
/// it is an atomic word.
pub struct SharedShardState {
    pub(crate) dying: AtomicBool,
    pub(crate) monitor: PreemptionMonitor,
    pub(crate) highres_timer_pending: AtomicBool,
}

/// Configuration for one shard's backend, builder style.
pub struct BackendConfig {
    pub(crate) id: usize,
    pub(crate) nr_shards: usize,
    pub(crate) max_networking_iocbs: usize,
    pub(crate) kernel_page_cache: bool,
    pub(crate) force_io_getevents_syscall: bool,
    pub(crate) aio_eventfd: bool,
    pub(crate) thread_pool: Box<dyn ThreadPool>,
}

impl BackendConfig {
    pub fn new() -> Self {
        Self {
            id: 0,
            nr_shards: 1,
            max_networking_iocbs: 10_000,
            kernel_page_cache: false,
            force_io_getevents_syscall: false,
            aio_eventfd: false,
            thread_pool: Box::new(SpawningThreadPool),
        }
    }

    /// Sets this shard's index, used for thread naming and log context.
    pub fn shard_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Sets the total shard count, used when sizing system-wide AIO needs.
    pub fn nr_shards(mut self, n: usize) -> Self {
        assert!(n > 0, "nr_shards must be > 0");
        self.nr_shards = n;
        self
    }

    /// Caps how many networking poll control blocks the linux-aio backend
    /// may keep in flight.
    pub fn max_networking_iocbs(mut self, n: usize) -> Self {
        assert!(n > 0, "max_networking_iocbs must be > 0");
        self.max_networking_iocbs = n;
        self
    }

    /// Declares that files go through the kernel page cache, where
    /// linux-aio submission may block and must be off-loaded.
    pub fn kernel_page_cache(mut self, enabled: bool) -> Self {
        self.kernel_page_cache = enabled;
        self
    }

    /// Forces event reaping through the syscall instead of the mapped
    /// completion ring.
    pub fn force_io_getevents_syscall(mut self, enabled: bool) -> Self {
        self.force_io_getevents_syscall = enabled;
        self
    }

    /// Attaches an eventfd notification to storage submissions so a
    /// sleeping shard is woken by disk completions.
    pub fn aio_eventfd(mut self, enabled: bool) -> Self {
        self.aio_eventfd = enabled;
        self
    }

    /// Supplies the worker pool used by the storage retry path.
    pub fn thread_pool(mut self, pool: Box<dyn ThreadPool>) -> Self {
        self.thread_pool = pool;
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The reactor-owned state a backend works against.
///
/// One per shard, created before the backend and handed to it at
/// construction. Owns the cross-shard wakeup eventfd, the task-quota
/// timer, and the software preemption monitor.
pub struct ReactorHandle {
    cfg: BackendConfig,
    io_sink: IoSink,
    io_stats: IoStats,
    notify_eventfd: FileDesc,
    task_quota_timer: FileDesc,
    aio_eventfd: Option<FileDesc>,
    shared: Arc<SharedShardState>,
    highres_timer_service: RefCell<Option<Box<dyn Fn()>>>,
    signal_action: RefCell<Option<Box<dyn Fn(i32)>>>,
}

impl ReactorHandle {
    pub fn new(cfg: BackendConfig) -> io::Result<Rc<Self>> {
        let notify_eventfd = FileDesc::eventfd(0)?;
        let task_quota_timer = FileDesc::timerfd_blocking()?;
        let aio_eventfd = if cfg.aio_eventfd {
            Some(FileDesc::eventfd(0)?)
        } else {
            None
        };

        let shared = Arc::new(SharedShardState {
            dying: AtomicBool::new(false),
            monitor: PreemptionMonitor::new(),
            highres_timer_pending: AtomicBool::new(false),
        });

        let handle = Rc::new(Self {
            cfg,
            io_sink: IoSink::new(),
            io_stats: IoStats {
                aio_errors: Cell::new(0),
            },
            notify_eventfd,
            task_quota_timer,
            aio_eventfd,
            shared,
            highres_timer_service: RefCell::new(None),
            signal_action: RefCell::new(None),
        });

        // Until a backend's start_tick installs its own monitor, the
        // software monitor answers the shard's preemption checks.
        preempt::set_need_preempt_var(&handle.shared.monitor);

        Ok(handle)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.cfg
    }

    pub fn io_sink(&self) -> &IoSink {
        &self.io_sink
    }

    pub fn io_stats(&self) -> &IoStats {
        &self.io_stats
    }

    /// Queues a disk I/O request with its completion callback.
    pub fn submit_io(&self, request: IoRequest, callback: impl FnOnce(isize) + 'static) {
        self.io_sink.submit(request, Completion::io(callback));
    }

    pub(crate) fn notify_eventfd(&self) -> &FileDesc {
        &self.notify_eventfd
    }

    /// Raw handle peers use to wake this shard out of a kernel sleep.
    ///
    /// Writing an 8-byte value to it is async-signal and cross-thread
    /// safe.
    pub fn notify_eventfd_raw(&self) -> RawFd {
        self.notify_eventfd.raw()
    }

    pub(crate) fn task_quota_timer(&self) -> &FileDesc {
        &self.task_quota_timer
    }

    pub(crate) fn aio_eventfd(&self) -> Option<&FileDesc> {
        self.aio_eventfd.as_ref()
    }

    pub(crate) fn shared(&self) -> &Arc<SharedShardState> {
        &self.shared
    }

    pub(crate) fn preemption_monitor(&self) -> *const PreemptionMonitor {
        &self.shared.monitor
    }

    pub(crate) fn thread_pool(&self) -> &dyn ThreadPool {
        &*self.cfg.thread_pool
    }

    /// Registers the callback run when the high-resolution timer fires.
    pub fn on_highres_timer(&self, f: impl Fn() + 'static) {
        *self.highres_timer_service.borrow_mut() = Some(Box::new(f));
    }

    pub(crate) fn service_highres_timer(&self) {
        if let Some(f) = &*self.highres_timer_service.borrow() {
            f();
        }
    }

    /// Registers the action invoked when the backend reports a signal.
    pub fn on_signal(&self, f: impl Fn(i32) + 'static) {
        *self.signal_action.borrow_mut() = Some(Box::new(f));
    }

    pub(crate) fn deliver_signal(&self, signo: i32) {
        if let Some(f) = &*self.signal_action.borrow() {
            f(signo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::request::IoRequest;

    #[test]
    fn sink_gives_back_unconsumed_pairs() {
        let sink = IoSink::new();
        sink.submit(IoRequest::fdatasync(1), Completion::io(|_| {}));
        sink.submit(IoRequest::fdatasync(2), Completion::io(|_| {}));

        let mut seen = Vec::new();
        let consumed = sink.drain(|req, completion| {
            if req.fd() == 2 {
                return Err((req, completion));
            }
            seen.push(req.fd());
            Ok(())
        });

        assert_eq!(consumed, 1);
        assert_eq!(seen, vec![1]);

        // The rejected request is still queued, at the front.
        let consumed = sink.drain(|req, _| {
            seen.push(req.fd());
            Ok(())
        });
        assert_eq!(consumed, 1);
        assert_eq!(seen, vec![1, 2]);
    }
}
