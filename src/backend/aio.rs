//! Backend using Linux AIO for everything.
//!
//! One kernel-wait path serves the whole shard: file-descriptor
//! readiness is expressed as `IOCB_CMD_POLL` control blocks, timerfd and
//! eventfd waits as recurring polls, and disk I/O goes through the
//! shared storage context. The reactor sleeps inside `io_pgetevents` on
//! the polling ring.

use std::io;
use std::cell::RefCell;
use std::rc::Rc;

use crate::aio::{AioGeneralContext, AioStorageContext, PreemptIoContext};
use crate::completion::{
    Completion, CompletionFuture, RecurringRole, complete_from_user_data, user_data_for,
};
use crate::pollable::PollableFdState;
use crate::shard::ReactorHandle;
use crate::sys;
use crate::sys::aio::{self, IoEvent};
use crate::sys::fd::FileDesc;

use super::Backend;

pub struct AioBackend {
    reactor: Rc<ReactorHandle>,
    hrtimer_timerfd: FileDesc,
    storage: RefCell<AioStorageContext>,
    preempting_io: RefCell<PreemptIoContext>,
    polling_io: RefCell<AioGeneralContext>,
    hrtimer_poll: Rc<Completion>,
    smp_wakeup: Rc<Completion>,
    /// Watches the reactor's aio eventfd, which storage submissions
    /// signal on completion; armed before sleeping so disk completions
    /// end the sleep.
    aio_eventfd_poll: Option<Rc<Completion>>,
}

impl AioBackend {
    pub fn new(reactor: Rc<ReactorHandle>) -> io::Result<Self> {
        let hrtimer_timerfd = FileDesc::timerfd()?;
        let mut storage = AioStorageContext::new(reactor.clone())?;
        let preempting_io = PreemptIoContext::new(reactor.clone(), hrtimer_timerfd.raw())?;
        let polling_io = AioGeneralContext::new(reactor.config().max_networking_iocbs)?;
        let hrtimer_poll = Completion::recurring(
            hrtimer_timerfd.raw(),
            RecurringRole::HrTimer(reactor.clone()),
        );
        let smp_wakeup =
            Completion::recurring(reactor.notify_eventfd().raw(), RecurringRole::SmpWakeup);
        let aio_eventfd_poll = reactor.aio_eventfd().map(|eventfd| {
            storage.mark_eventfd_registered();
            Completion::recurring(eventfd.raw(), RecurringRole::StorageEventfd)
        });

        // Protect against spurious wakeups - if we get notified that the
        // timer has expired when it really hasn't, we don't want to block
        // in read(tfd, ...).
        reactor.task_quota_timer().set_nonblocking()?;

        Ok(Self {
            reactor,
            hrtimer_timerfd,
            storage: RefCell::new(storage),
            preempting_io: RefCell::new(preempting_io),
            polling_io: RefCell::new(polling_io),
            hrtimer_poll,
            smp_wakeup,
            aio_eventfd_poll,
        })
    }

    /// Waits up to `timeout_ms` (`-1` = indefinitely) on the polling
    /// ring, delivering everything reaped. Loops with a zero timeout
    /// while full batches keep arriving.
    fn await_events(&self, timeout_ms: i32, active_sigmask: Option<&libc::sigset_t>) -> bool {
        const BATCH_SIZE: usize = 128;

        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let mut timeout = match timeout_ms {
            0 => Some(zero),
            -1 => None,
            ms => Some(libc::timespec {
                tv_sec: ms as i64 / 1000,
                tv_nsec: (ms as i64 % 1000) * 1_000_000,
            }),
        };

        let io_context = self.polling_io.borrow().io_context();
        let mut batch = [IoEvent::zeroed(); BATCH_SIZE];
        let mut did_work = false;
        loop {
            let n = match aio::io_pgetevents(
                io_context,
                1,
                &mut batch,
                timeout.as_ref(),
                active_sigmask,
            ) {
                Ok(n) => n,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => return true,
                Err(err) => panic!("io_pgetevents failed: {err}"),
            };
            for event in &batch[..n] {
                did_work = true;
                unsafe {
                    complete_from_user_data(event.data, event.res as isize);
                }
            }
            if n < BATCH_SIZE {
                break;
            }
            // We may have waited already; further rounds only sweep
            // leftovers.
            timeout = Some(zero);
        }
        did_work
    }

    fn poll(&self, fd: &Rc<PollableFdState>, events: u32) -> CompletionFuture {
        if fd.take_known(events) {
            return CompletionFuture::ready(fd.clone(), events);
        }

        fd.events_rw.set(events == (sys::POLL_IN | sys::POLL_OUT));

        let iocb = fd.iocb(events);
        let completion = fd.completion(events);
        unsafe {
            *iocb = aio::make_poll_iocb(fd.fd().raw(), events);
            aio::set_user_data(&mut *iocb, user_data_for(completion));
        }
        completion.slot().arm();
        self.polling_io.borrow_mut().queue(iocb);
        CompletionFuture::pending(fd.clone(), events)
    }
}

impl Backend for AioBackend {
    fn reap_kernel_completions(&self) -> bool {
        let mut did_work = self.await_events(0, None);
        did_work |= self.storage.borrow_mut().reap_completions(true);
        did_work
    }

    fn kernel_submit_work(&self) -> bool {
        let mut did_work = {
            let mut polling_io = self.polling_io.borrow_mut();
            self.hrtimer_poll.maybe_queue(&mut polling_io);
            polling_io.flush() > 0
        };
        did_work |= self.storage.borrow_mut().submit_work();
        did_work
    }

    fn kernel_events_can_sleep(&self) -> bool {
        self.storage.borrow().can_sleep()
    }

    fn wait_and_process_events(&self, active_sigmask: Option<&libc::sigset_t>) {
        let mut timeout = -1;
        if self.preempting_io.borrow_mut().service_preempting_io() {
            timeout = 0;
        }

        {
            let mut polling_io = self.polling_io.borrow_mut();
            self.hrtimer_poll.maybe_queue(&mut polling_io);
            self.smp_wakeup.maybe_queue(&mut polling_io);
            if let Some(aio_eventfd_poll) = &self.aio_eventfd_poll {
                aio_eventfd_poll.maybe_queue(&mut polling_io);
            }
            polling_io.flush();
        }
        self.await_events(timeout, active_sigmask);
        // Clear the task quota tick the sleep may have accumulated.
        self.preempting_io.borrow_mut().service_preempting_io();
    }

    fn readable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture {
        self.poll(fd, sys::POLL_IN)
    }

    fn writeable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture {
        self.poll(fd, sys::POLL_OUT)
    }

    fn readable_or_writeable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture {
        self.poll(fd, sys::POLL_IN | sys::POLL_OUT)
    }

    fn forget(&self, fd: Rc<PollableFdState>) {
        fd.begin_forget();
        {
            let mut polling_io = self.polling_io.borrow_mut();
            // Anything still queued must reach the kernel before it can
            // be cancelled.
            polling_io.flush();
            polling_io.cancel(fd.iocb(sys::POLL_IN));
            polling_io.cancel(fd.iocb(sys::POLL_OUT));
        }
        self.reap_kernel_completions();
        // A successfully cancelled poll posts no event; resolve any
        // waiter that is still parked.
        fd.completion(sys::POLL_IN).slot().abort();
        fd.completion(sys::POLL_OUT).slot().abort();
    }

    fn shutdown(&self, fd: &PollableFdState, how: libc::c_int) {
        let _ = fd.fd().shutdown(how);
    }

    fn arm_highres_timer(&self, its: &libc::itimerspec) {
        let _ = self.hrtimer_timerfd.timerfd_settime_abs(its);
    }

    fn start_tick(&self) {
        self.preempting_io.borrow().start_tick();
    }

    fn stop_tick(&self) {
        self.preempting_io.borrow().stop_tick();
    }

    fn request_preemption(&self) {
        self.preempting_io.borrow_mut().request_preemption();
    }

    fn reset_preemption_monitor(&self) {
        self.preempting_io.borrow_mut().reset_preemption_monitor();
    }

    fn start_handling_signal(&self) {
        // Nothing to do: request_preemption here is not signal safe, and
        // the signals this backend sees need no immediate handling.
    }

    fn signal_received(&self, signo: i32) {
        self.reactor.deliver_signal(signo);
    }

    fn make_pollable_fd_state(&self, fd: FileDesc, speculate: u32) -> Rc<PollableFdState> {
        PollableFdState::new(fd, speculate)
    }
}

impl Drop for AioBackend {
    fn drop(&mut self) {
        self.storage.borrow_mut().stop();
    }
}
