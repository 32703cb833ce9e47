//! Backend using `io_uring` for everything.
//!
//! One ring serves readiness polls, disk I/O, and timer/eventfd waits.
//! Preemption keeps the tiny AIO ring: io_uring has no mapping that lets
//! the hot-path check read a kernel-bumped counter, and the AIO trick
//! costs nothing here.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use io_uring::{IoUring, opcode, squeue, types};

use crate::aio::PreemptIoContext;
use crate::completion::{Completion, CompletionFuture, RecurringRole, user_data_for};
use crate::pollable::PollableFdState;
use crate::request::IoRequest;
use crate::shard::ReactorHandle;
use crate::sys;
use crate::sys::fd::FileDesc;

use super::Backend;

/// More or less arbitrary: too low and batches get small, too high and
/// the ring pins too much locked memory.
const QUEUE_LEN: u32 = 200;

/// Creates a ring and verifies the features and opcodes this backend
/// relies on.
pub(crate) fn try_create_uring(queue_len: u32) -> io::Result<IoUring> {
    let ring = IoUring::new(queue_len)?;

    if !ring.params().is_feature_submit_stable() || !ring.params().is_feature_nodrop() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "missing required io_uring features",
        ));
    }

    let mut probe = io_uring::Probe::new();
    ring.submitter().register_probe(&mut probe)?;
    let required_ops = [
        opcode::PollAdd::CODE,
        opcode::Read::CODE,
        opcode::Write::CODE,
        opcode::Readv::CODE,
        opcode::Writev::CODE,
        opcode::Fsync::CODE,
    ];
    for op in required_ops {
        if !probe.is_supported(op) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "required io_uring opcode not supported",
            ));
        }
    }

    Ok(ring)
}

pub struct UringBackend {
    reactor: Rc<ReactorHandle>,
    ring: RefCell<IoUring>,
    did_work_while_getting_sqe: Cell<bool>,
    has_pending_submissions: Cell<bool>,
    hrtimer_timerfd: FileDesc,
    preempt_io: RefCell<PreemptIoContext>,
    hrtimer_completion: Rc<Completion>,
    smp_wakeup_completion: Rc<Completion>,
}

impl UringBackend {
    pub fn new(reactor: Rc<ReactorHandle>) -> io::Result<Self> {
        let ring = try_create_uring(QUEUE_LEN)?;
        let hrtimer_timerfd = FileDesc::timerfd()?;
        let preempt_io = PreemptIoContext::new(reactor.clone(), hrtimer_timerfd.raw())?;
        let hrtimer_completion = Completion::recurring(
            hrtimer_timerfd.raw(),
            RecurringRole::HrTimer(reactor.clone()),
        );
        let smp_wakeup_completion =
            Completion::recurring(reactor.notify_eventfd().raw(), RecurringRole::SmpWakeup);

        // Protect against spurious wakeups - if we get notified that the
        // timer has expired when it really hasn't, we don't want to block
        // in read(tfd, ...).
        reactor.task_quota_timer().set_nonblocking()?;

        Ok(Self {
            reactor,
            ring: RefCell::new(ring),
            did_work_while_getting_sqe: Cell::new(false),
            has_pending_submissions: Cell::new(false),
            hrtimer_timerfd,
            preempt_io: RefCell::new(preempt_io),
            hrtimer_completion,
            smp_wakeup_completion,
        })
    }

    /// Pushes an entry, making room when the submission ring is full by
    /// flushing and reaping until the push succeeds.
    fn push_sqe(&self, entry: squeue::Entry) {
        loop {
            let pushed = {
                let mut ring = self.ring.borrow_mut();
                let result = unsafe { ring.submission().push(&entry) };
                result.is_ok()
            };
            if pushed {
                self.has_pending_submissions.set(true);
                return;
            }
            self.do_flush_submission_ring();
            self.do_process_kernel_completions_step();
            self.did_work_while_getting_sqe.set(true);
        }
    }

    fn do_flush_submission_ring(&self) -> bool {
        if self.has_pending_submissions.get() {
            self.has_pending_submissions.set(false);
            self.did_work_while_getting_sqe.set(false);
            let _ = self.ring.borrow().submit();
            true
        } else {
            self.did_work_while_getting_sqe.replace(false)
        }
    }

    /// Reaps one batch of ready completions. Returns whether any were
    /// processed.
    fn do_process_kernel_completions_step(&self) -> bool {
        // Collect first, deliver after the ring borrow is gone: a
        // delivery may wake a task whose waker re-enters the backend.
        let reaped: Vec<(u64, i32)> = {
            let mut ring = self.ring.borrow_mut();
            let completion = ring.completion();
            completion.map(|cqe| (cqe.user_data(), cqe.result())).collect()
        };
        for &(user_data, res) in &reaped {
            // Disk I/O completions own their pointee (one strong count
            // was leaked at submission); everything else points at
            // backend- or state-owned completions.
            let completion = user_data as *const Completion;
            unsafe {
                (*completion).complete_with(res as isize);
                if (*completion).is_io() {
                    drop(Rc::from_raw(completion));
                } else {
                    decrement_kernel_ref(&*completion);
                }
            }
        }
        !reaped.is_empty()
    }

    fn do_process_kernel_completions(&self) -> bool {
        let mut did_work = false;
        while self.do_process_kernel_completions_step() {
            did_work = true;
        }
        did_work | self.did_work_while_getting_sqe.replace(false)
    }

    fn poll(&self, fd: &Rc<PollableFdState>, events: u32) -> CompletionFuture {
        if fd.take_known(events) {
            return CompletionFuture::ready(fd.clone(), events);
        }

        fd.events_rw.set(events == (sys::POLL_IN | sys::POLL_OUT));

        let completion = fd.completion(events);
        completion.slot().arm();
        fd.kernel_refs.set(fd.kernel_refs.get() + 1);
        let entry = opcode::PollAdd::new(types::Fd(fd.fd().raw()), events)
            .build()
            .user_data(user_data_for(completion) as u64);
        self.push_sqe(entry);
        CompletionFuture::pending(fd.clone(), events)
    }

    fn cancel(&self, fd: &Rc<PollableFdState>, events: u32) {
        let target = user_data_for(fd.completion(events)) as u64;
        fd.kernel_refs.set(fd.kernel_refs.get() + 1);
        let entry = opcode::AsyncCancel::new(target)
            .build()
            .user_data(user_data_for(&fd.cancel) as u64);
        self.push_sqe(entry);
    }

    fn submit_io_request(&self, request: IoRequest, completion: Rc<Completion>) {
        let entry = match request {
            IoRequest::Read { fd, pos, buf, len, .. } => {
                opcode::Read::new(types::Fd(fd), buf, len as u32)
                    .offset(pos)
                    .build()
            }
            IoRequest::Write { fd, pos, buf, len, .. } => {
                opcode::Write::new(types::Fd(fd), buf, len as u32)
                    .offset(pos)
                    .build()
            }
            IoRequest::Readv {
                fd, pos, iov, iov_len, ..
            } => opcode::Readv::new(types::Fd(fd), iov, iov_len as u32)
                .offset(pos)
                .build(),
            IoRequest::Writev {
                fd, pos, iov, iov_len, ..
            } => opcode::Writev::new(types::Fd(fd), iov, iov_len as u32)
                .offset(pos)
                .build(),
            IoRequest::Fdatasync { fd } => opcode::Fsync::new(types::Fd(fd))
                .flags(types::FsyncFlags::DATASYNC)
                .build(),
        };
        // The kernel round-trip holds one strong count, released when the
        // completion is reaped.
        let user_data = Rc::into_raw(completion) as u64;
        self.push_sqe(entry.user_data(user_data));
    }

    fn queue_pending_file_io(&self) -> bool {
        self.reactor.io_sink().drain(|request, completion| {
            self.submit_io_request(request, completion);
            Ok(())
        }) > 0
    }

    /// Re-arms a recurring timerfd/eventfd poll if it is not in flight.
    fn maybe_rearm(&self, completion: &Rc<Completion>) {
        let poll = completion.recurring_poll();
        if poll.is_armed() {
            return;
        }
        poll.mark_armed();
        let entry = opcode::PollAdd::new(types::Fd(poll.fd()), sys::POLL_IN)
            .build()
            .user_data(user_data_for(completion) as u64);
        self.push_sqe(entry);
    }
}

/// Accounts a reaped submission against its owning descriptor state, so
/// `forget` knows when the kernel holds no more references.
fn decrement_kernel_ref(completion: &Completion) {
    if let Some(state) = completion.owner() {
        state.kernel_refs.set(state.kernel_refs.get() - 1);
    }
}

impl Backend for UringBackend {
    fn reap_kernel_completions(&self) -> bool {
        self.do_process_kernel_completions()
    }

    fn kernel_submit_work(&self) -> bool {
        let mut did_work = self.preempt_io.borrow_mut().service_preempting_io();
        did_work |= self.queue_pending_file_io();
        did_work |= self.do_flush_submission_ring();
        did_work
    }

    fn kernel_events_can_sleep(&self) -> bool {
        // The ring delivers completions while we sleep; no need to spin.
        true
    }

    fn wait_and_process_events(&self, active_sigmask: Option<&libc::sigset_t>) {
        self.maybe_rearm(&self.smp_wakeup_completion);
        self.maybe_rearm(&self.hrtimer_completion);
        self.do_flush_submission_ring();

        let mut did_work = self.preempt_io.borrow_mut().service_preempting_io();
        did_work |= self.did_work_while_getting_sqe.replace(false);
        if did_work {
            return;
        }

        let wait_result = {
            let ring = self.ring.borrow();
            match active_sigmask {
                Some(mask) => {
                    let args = types::SubmitArgs::new().sigmask(mask);
                    ring.submitter().submit_with_args(1, &args)
                }
                None => ring.submitter().submit_and_wait(1),
            }
        };
        match wait_result {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => return,
            Err(err) => panic!("io_uring wait failed: {err}"),
        }

        self.do_process_kernel_completions();
        self.preempt_io.borrow_mut().service_preempting_io();
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
        self.cancel(&fd, sys::POLL_IN);
        self.cancel(&fd, sys::POLL_OUT);
        self.do_flush_submission_ring();
        self.reap_kernel_completions();
        // Cancellation is asynchronous; the state cannot go away while
        // the kernel still holds pointers into it.
        while fd.kernel_refs.get() > 0 {
            let _ = self.ring.borrow().submitter().submit_and_wait(1);
            self.reap_kernel_completions();
        }
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
        self.preempt_io.borrow().start_tick();
    }

    fn stop_tick(&self) {
        self.preempt_io.borrow().stop_tick();
    }

    fn request_preemption(&self) {
        self.preempt_io.borrow_mut().request_preemption();
    }

    fn reset_preemption_monitor(&self) {
        self.preempt_io.borrow_mut().reset_preemption_monitor();
    }

    fn start_handling_signal(&self) {
        // Nothing special wrt. signals.
    }

    fn signal_received(&self, signo: i32) {
        self.reactor.deliver_signal(signo);
    }

    fn make_pollable_fd_state(&self, fd: FileDesc, speculate: u32) -> Rc<PollableFdState> {
        PollableFdState::new(fd, speculate)
    }
}
