//! Backend using `epoll` for readiness.
//!
//! Readiness is level-triggered with per-descriptor mask tracking, disk
//! I/O still goes through the shared AIO storage context, and preemption
//! comes from a helper thread waiting on the quota and high-resolution
//! timerfds. The helper never touches reactor data structures beyond the
//! shared atomics and the (kernel-mediated) timerfds.

use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::unix::thread::JoinHandleExt;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{Ordering, compiler_fence};
use std::thread;

use log::{error, warn};

use crate::aio::AioStorageContext;
use crate::completion::CompletionFuture;
use crate::pollable::PollableFdState;
use crate::shard::{ReactorHandle, SharedShardState};
use crate::sys;
use crate::sys::fd::{self, FileDesc};

use super::Backend;

/// Wake-up token for the cross-shard notification eventfd.
const NOTIFY_TOKEN: u64 = 0;

/// Token for the reactor-side steady-clock timerfd.
const HRTIMER_TOKEN: u64 = 1;

/// Token for the aio eventfd that storage submissions signal on
/// completion.
///
/// These values are below any heap address, so they can never collide
/// with the pollable-state pointers used as tokens otherwise.
const AIO_EVENTFD_TOKEN: u64 = 2;

pub struct EpollBackend {
    reactor: Rc<ReactorHandle>,
    epollfd: FileDesc,
    storage: RefCell<AioStorageContext>,

    /// Two timerfds carry the high-resolution deadline: one is watched
    /// by epoll while the shard sleeps, the other by the helper thread
    /// while it runs. The deadline is handed between them around each
    /// sleep, avoiding both redundant wakeups and missed deadlines.
    steady_clock_timer_reactor_thread: FileDesc,
    steady_clock_timer_timer_thread: FileDesc,
    steady_clock_timer_deadline: Cell<libc::itimerspec>,

    timer_thread: RefCell<Option<thread::JoinHandle<()>>>,
    need_epoll_events: Cell<bool>,
    shared: Arc<SharedShardState>,
}

impl EpollBackend {
    pub fn new(reactor: Rc<ReactorHandle>) -> io::Result<Self> {
        let epollfd = FileDesc::epoll()?;
        let steady_clock_timer_reactor_thread = FileDesc::timerfd()?;
        let steady_clock_timer_timer_thread = FileDesc::timerfd()?;
        let mut storage = AioStorageContext::new(reactor.clone())?;
        let shared = reactor.shared().clone();

        epoll_ctl_add(&epollfd, reactor.notify_eventfd().raw(), NOTIFY_TOKEN)?;
        epoll_ctl_add(
            &epollfd,
            steady_clock_timer_reactor_thread.raw(),
            HRTIMER_TOKEN,
        )?;
        if let Some(eventfd) = reactor.aio_eventfd() {
            // With the eventfd watched, a sleep cannot strand in-flight
            // disk I/O: any storage completion ends it.
            epoll_ctl_add(&epollfd, eventfd.raw(), AIO_EVENTFD_TOKEN)?;
            storage.mark_eventfd_registered();
        }

        Ok(Self {
            reactor,
            epollfd,
            storage: RefCell::new(storage),
            steady_clock_timer_reactor_thread,
            steady_clock_timer_timer_thread,
            steady_clock_timer_deadline: Cell::new(unsafe { mem::zeroed() }),
            timer_thread: RefCell::new(None),
            need_epoll_events: Cell::new(false),
            shared,
        })
    }

    fn get_epoll_future(&self, fd: &Rc<PollableFdState>, event: u32) -> CompletionFuture {
        if fd.take_known(event) {
            return CompletionFuture::ready(fd.clone(), event);
        }

        fd.events_rw
            .set(event == (sys::POLL_IN | sys::POLL_OUT));
        fd.events_requested.set(fd.events_requested.get() | event);

        if fd.events_epoll.get() & event != event {
            let op = if fd.events_epoll.get() != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_ADD
            };
            fd.events_epoll.set(fd.events_epoll.get() | event);
            let mut evt = libc::epoll_event {
                events: fd.events_epoll.get(),
                u64: Rc::as_ptr(fd) as u64,
            };
            let rc = unsafe { libc::epoll_ctl(self.epollfd.raw(), op, fd.fd().raw(), &mut evt) };
            assert_eq!(rc, 0, "epoll_ctl failed: {}", io::Error::last_os_error());
            self.need_epoll_events.set(true);
        }

        fd.completion(event).slot().arm();
        CompletionFuture::pending(fd.clone(), event)
    }

    fn complete_epoll_event(&self, state: &PollableFdState, events: u32, event_mask: u32) {
        if state.events_requested.get() & events & event_mask != 0 {
            state
                .events_requested
                .set(state.events_requested.get() & !event_mask);
            state
                .events_known
                .set(state.events_known.get() & !event_mask);
            state.completion(event_mask).slot().complete();
        }
    }

    fn switch_steady_clock_timers(&self, from: &FileDesc, to: &FileDesc) {
        let deadline = self.steady_clock_timer_deadline.get();
        if fd::itimerspec_is_zero(&deadline) {
            return;
        }
        // Enable-then-disable, so the hardware timer doesn't have to be
        // reprogrammed.
        let _ = to.timerfd_settime_abs(&deadline);
        let _ = from.timerfd_settime_abs(&unsafe { mem::zeroed() });
    }

    fn maybe_switch_steady_clock_timers(&self, timeout: i32, from: &FileDesc, to: &FileDesc) {
        if timeout != 0 {
            self.switch_steady_clock_timers(from, to);
        }
    }

    fn wait_and_process(&self, timeout: i32, active_sigmask: Option<&libc::sigset_t>) -> bool {
        // If we plan to sleep, the helper thread's steady clock timer
        // cannot wake us; hand the deadline to the epoll-registered one.
        self.maybe_switch_steady_clock_timers(
            timeout,
            &self.steady_clock_timer_timer_thread,
            &self.steady_clock_timer_reactor_thread,
        );

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 128];
        let nr = unsafe {
            libc::epoll_pwait(
                self.epollfd.raw(),
                events.as_mut_ptr(),
                events.len() as i32,
                timeout,
                active_sigmask.map_or(ptr::null(), |m| m as *const libc::sigset_t),
            )
        };

        let mut did_work = false;
        if nr >= 0 {
            for i in 0..nr as usize {
                did_work = true;
                let evt = events[i];
                let token = evt.u64;

                if token == NOTIFY_TOKEN {
                    self.reactor.notify_eventfd().drain_counter();
                    continue;
                }
                if token == HRTIMER_TOKEN {
                    self.steady_clock_timer_reactor_thread.drain_counter();
                    self.shared
                        .highres_timer_pending
                        .store(true, Ordering::Relaxed);
                    self.steady_clock_timer_deadline
                        .set(unsafe { mem::zeroed() });
                    continue;
                }
                if token == AIO_EVENTFD_TOKEN {
                    if let Some(eventfd) = self.reactor.aio_eventfd() {
                        eventfd.drain_counter();
                    }
                    self.storage.borrow_mut().reap_completions(true);
                    continue;
                }

                let state = unsafe { &*(token as *const PollableFdState) };
                let mut reported = evt.events;
                if reported & (sys::POLL_HUP | sys::POLL_ERR) != 0 {
                    // Treat the events as the requested events when an
                    // error occurs; the read/write/accept/connect paths
                    // surface the specific error.
                    reported = state.events_requested.get();
                }
                let reported = reported & (sys::POLL_IN | sys::POLL_OUT);
                let events_to_remove = reported & !state.events_requested.get();

                if state.events_rw.get() {
                    // accept() signals normal completion via POLLIN but
                    // shutdown errors via POLLOUT|POLLHUP, so both
                    // directions resolve the same future.
                    self.complete_epoll_event(state, reported, sys::POLL_IN | sys::POLL_OUT);
                } else {
                    self.complete_epoll_event(state, reported, sys::POLL_IN);
                    self.complete_epoll_event(state, reported, sys::POLL_OUT);
                }

                if events_to_remove != 0 {
                    let remaining = state.events_epoll.get() & !events_to_remove;
                    state.events_epoll.set(remaining);
                    let op = if remaining != 0 {
                        libc::EPOLL_CTL_MOD
                    } else {
                        libc::EPOLL_CTL_DEL
                    };
                    let mut evt = libc::epoll_event {
                        events: remaining,
                        u64: token,
                    };
                    unsafe {
                        libc::epoll_ctl(self.epollfd.raw(), op, state.fd().raw(), &mut evt);
                    }
                }
            }
        } else {
            let err = io::Error::last_os_error();
            // gdb can cause EINTR here.
            assert_eq!(
                err.raw_os_error(),
                Some(libc::EINTR),
                "epoll_pwait failed: {err}"
            );
        }

        self.maybe_switch_steady_clock_timers(
            timeout,
            &self.steady_clock_timer_reactor_thread,
            &self.steady_clock_timer_timer_thread,
        );

        did_work
    }

    fn complete_hrtimer(&self) -> bool {
        // Set from either the timer helper thread or wait_and_process.
        if self.shared.highres_timer_pending.load(Ordering::Relaxed) {
            self.shared
                .highres_timer_pending
                .store(false, Ordering::Relaxed);
            self.reactor.service_highres_timer();
            return true;
        }
        false
    }
}

/// Body of the `timer-{shard}` helper thread.
///
/// Waits on the task-quota and steady-clock timerfds and requests
/// preemption whenever either fires. Runs until `dying` is observed.
fn timer_thread_fn(
    shared: Arc<SharedShardState>,
    task_quota_fd: i32,
    steady_clock_fd: i32,
) {
    unsafe {
        let mut mask: libc::sigset_t = mem::zeroed();
        libc::sigfillset(&mut mask);
        libc::sigdelset(&mut mask, libc::SIGSEGV);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut());
        if rc != 0 {
            error!("timer thread failed to block signals. Aborting.");
            std::process::abort();
        }
    }

    // Wait for the quota timer to be armed before ticking; the first
    // expiry doubles as the handshake.
    let mut expirations = [0u8; 8];
    unsafe {
        libc::read(task_quota_fd, expirations.as_mut_ptr() as *mut _, 8);
    }
    shared.monitor.head.store(1, Ordering::Relaxed);

    while !shared.dying.load(Ordering::Relaxed) {
        let mut pfds = [
            libc::pollfd {
                fd: task_quota_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: steady_clock_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), 2, -1) };
        assert!(rc != -1, "timer thread poll failed");

        if pfds[0].revents & libc::POLLIN != 0 {
            unsafe {
                libc::read(task_quota_fd, expirations.as_mut_ptr() as *mut _, 8);
            }
        }
        if pfds[1].revents & libc::POLLIN != 0 {
            unsafe {
                libc::read(steady_clock_fd, expirations.as_mut_ptr() as *mut _, 8);
            }
            shared.highres_timer_pending.store(true, Ordering::Relaxed);
        }

        shared.monitor.head.store(1, Ordering::Relaxed);

        // We're on the same core as the reactor, so even a signal fence
        // is overdoing it.
        compiler_fence(Ordering::SeqCst);
    }
}

impl Backend for EpollBackend {
    fn reap_kernel_completions(&self) -> bool {
        // epoll has no separate submission stage; readiness is collected
        // in kernel_submit_work so the reactor's two completion pollers
        // don't call epoll_wait twice. Only disk completions are reaped
        // here.
        self.storage.borrow_mut().reap_completions(true)
    }

    fn kernel_submit_work(&self) -> bool {
        let mut did_work = self.storage.borrow_mut().submit_work();
        if self.need_epoll_events.get() {
            did_work |= self.wait_and_process(0, None);
        }
        did_work |= self.complete_hrtimer();
        did_work
    }

    fn kernel_events_can_sleep(&self) -> bool {
        self.storage.borrow().can_sleep()
    }

    fn wait_and_process_events(&self, active_sigmask: Option<&libc::sigset_t>) {
        self.wait_and_process(-1, active_sigmask);
        self.complete_hrtimer();
    }

    fn readable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture {
        self.get_epoll_future(fd, sys::POLL_IN)
    }

    fn writeable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture {
        self.get_epoll_future(fd, sys::POLL_OUT)
    }

    fn readable_or_writeable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture {
        self.get_epoll_future(fd, sys::POLL_IN | sys::POLL_OUT)
    }

    fn forget(&self, fd: Rc<PollableFdState>) {
        if fd.events_epoll.get() != 0 {
            unsafe {
                libc::epoll_ctl(
                    self.epollfd.raw(),
                    libc::EPOLL_CTL_DEL,
                    fd.fd().raw(),
                    ptr::null_mut(),
                );
            }
        }
        fd.begin_forget();
        fd.completion(sys::POLL_IN).slot().abort();
        fd.completion(sys::POLL_OUT).slot().abort();
    }

    fn shutdown(&self, fd: &PollableFdState, how: libc::c_int) {
        let _ = fd.fd().shutdown(how);
    }

    fn arm_highres_timer(&self, its: &libc::itimerspec) {
        self.steady_clock_timer_deadline.set(*its);
        let _ = self.steady_clock_timer_timer_thread.timerfd_settime_abs(its);
    }

    fn start_tick(&self) {
        let shared = self.shared.clone();
        let task_quota_fd = self.reactor.task_quota_timer().raw();
        let steady_clock_fd = self.steady_clock_timer_timer_thread.raw();
        let id = self.reactor.config().id;

        let handle = thread::Builder::new()
            .name(format!("timer-{id}"))
            .spawn(move || timer_thread_fn(shared, task_quota_fd, steady_clock_fd))
            .expect("failed to spawn timer thread");

        let sp = libc::sched_param { sched_priority: 1 };
        let rc =
            unsafe { libc::pthread_setschedparam(handle.as_pthread_t(), libc::SCHED_FIFO, &sp) };
        if rc != 0 && id == 0 {
            warn!(
                "Unable to set SCHED_FIFO scheduling policy for timer thread; \
                 latency impact possible. Try adding CAP_SYS_NICE"
            );
        }

        *self.timer_thread.borrow_mut() = Some(handle);
    }

    fn stop_tick(&self) {
        self.shared.dying.store(true, Ordering::Relaxed);
        // Make the quota timer fire soon so the helper notices `dying`.
        let _ = self
            .reactor
            .task_quota_timer()
            .timerfd_settime_rel(&fd::periodic_itimerspec(1, 1_000_000));
        if let Some(handle) = self.timer_thread.borrow_mut().take() {
            let _ = handle.join();
        }
    }

    fn request_preemption(&self) {
        self.shared.monitor.head.store(1, Ordering::Relaxed);
    }

    fn reset_preemption_monitor(&self) {
        self.shared.monitor.head.store(0, Ordering::Relaxed);
    }

    fn start_handling_signal(&self) {
        // The high resolution timer uses signals on this backend, so a
        // signal may mean a deadline: request preemption to reassess.
        self.request_preemption();
    }

    fn signal_received(&self, signo: i32) {
        self.reactor.deliver_signal(signo);
    }

    fn make_pollable_fd_state(&self, fd: FileDesc, speculate: u32) -> Rc<PollableFdState> {
        PollableFdState::new(fd, speculate)
    }
}

fn epoll_ctl_add(epollfd: &FileDesc, fd: i32, token: u64) -> io::Result<()> {
    let mut event = libc::epoll_event {
        events: sys::POLL_IN,
        u64: token,
    };
    let rc = unsafe { libc::epoll_ctl(epollfd.raw(), libc::EPOLL_CTL_ADD, fd, &mut event) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::shard::{BackendConfig, ReactorHandle};
    use crate::sys;
    use crate::sys::fd::FileDesc;
    use std::future::Future;
    use std::pin::pin;
    use std::ptr;
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop_waker() -> Waker {
        const VTABLE: RawWakerVTable =
            RawWakerVTable::new(|_| RawWaker::new(ptr::null(), &VTABLE), |_| {}, |_| {}, |_| {});
        unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &VTABLE)) }
    }

    fn poll_once<F: Future>(future: &mut std::pin::Pin<&mut F>) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        future.as_mut().poll(&mut cx)
    }

    fn socketpair() -> (FileDesc, FileDesc) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (FileDesc::from_raw(fds[0]), FileDesc::from_raw(fds[1]))
    }

    #[test]
    fn mask_shrinks_to_remaining_interest() {
        let reactor = ReactorHandle::new(BackendConfig::new()).unwrap();
        let backend = EpollBackend::new(reactor).unwrap();

        let (a, b) = socketpair();
        let state = backend.make_pollable_fd_state(a, 0);

        let mut readable = pin!(backend.readable(&state));
        let mut writeable = pin!(backend.writeable(&state));
        assert!(poll_once(&mut readable).is_pending());
        assert!(poll_once(&mut writeable).is_pending());
        assert_eq!(
            state.events_epoll.get(),
            sys::POLL_IN | sys::POLL_OUT,
            "both interests registered"
        );

        // Trigger readability; the socketpair is also writeable, so both
        // futures resolve in the same round.
        b.write(b"x").unwrap();
        for _ in 0..100 {
            if backend.wait_and_process(0, None) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        assert!(poll_once(&mut readable).is_ready());
        assert!(poll_once(&mut writeable).is_ready());
        assert_eq!(state.events_requested.get(), 0);

        // The next wakeup reports readiness nobody awaits anymore; that
        // is when the kernel-side mask is trimmed.
        backend.wait_and_process(0, None);
        assert_eq!(
            state.events_epoll.get(),
            0,
            "no residual kernel-side interest once nothing is awaited"
        );

        // Re-requesting readable with data still buffered resolves after
        // one more registration round.
        let mut readable = pin!(backend.readable(&state));
        assert!(poll_once(&mut readable).is_pending());
        assert_eq!(state.events_epoll.get(), sys::POLL_IN);
        for _ in 0..100 {
            if backend.wait_and_process(0, None) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(poll_once(&mut readable).is_ready());

        backend.forget(state);
        drop(b);
    }
}
