//! The preemption engine.
//!
//! A dedicated two-slot AIO ring watches the task-quota timer and the
//! high-resolution timer. The trick: the kernel maps every AIO context's
//! completion ring into userspace and bumps its tail counter on each
//! completion, out of band. Pointing the shard's preemption check at that
//! counter pair turns "has the quota expired?" into a plain memory read —
//! no syscall, no signal handler.

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{Ordering, compiler_fence};

use crate::completion::{Completion, RecurringRole, complete_from_user_data};
use crate::preempt::{PreemptionMonitor, need_preempt, set_need_preempt_var};
use crate::shard::ReactorHandle;
use crate::sys::aio::{self, AIO_RING_COUNTER_OFFSET, IoEvent};
use crate::sys::fd;

use super::AioGeneralContext;

pub(crate) struct PreemptIoContext {
    reactor: Rc<ReactorHandle>,
    context: AioGeneralContext,
    task_quota: Rc<Completion>,
    hrtimer: Rc<Completion>,
    hrtimer_fd: RawFd,
}

impl PreemptIoContext {
    /// `hrtimer_fd` is the owning backend's high-resolution timerfd; the
    /// task-quota timer comes from the reactor.
    pub(crate) fn new(reactor: Rc<ReactorHandle>, hrtimer_fd: RawFd) -> io::Result<Self> {
        let context = AioGeneralContext::new(2)?;
        let task_quota = Completion::recurring(
            reactor.task_quota_timer().raw(),
            RecurringRole::TaskQuota,
        );
        let hrtimer =
            Completion::recurring(hrtimer_fd, RecurringRole::HrTimer(reactor.clone()));
        Ok(Self {
            reactor,
            context,
            task_quota,
            hrtimer,
            hrtimer_fd,
        })
    }

    /// Preempt whenever an event (timer tick) lands on this ring: the
    /// shard's preemption checks now read the ring's own head/tail
    /// counters, which the kernel advances without our involvement.
    pub(crate) fn start_tick(&self) {
        let counters =
            (self.context.io_context() as usize + AIO_RING_COUNTER_OFFSET) as *const PreemptionMonitor;
        set_need_preempt_var(counters);
    }

    /// Restores the reactor-owned software monitor.
    pub(crate) fn stop_tick(&self) {
        set_need_preempt_var(self.reactor.preemption_monitor());
    }

    /// Forces the preemption flag on, synchronously.
    ///
    /// Arms the high-resolution timer one nanosecond in the past so the
    /// kernel posts a completion at once, then waits for it to land. The
    /// wait is bounded: the kernel owes us exactly one event.
    pub(crate) fn request_preemption(&mut self) {
        let expired = fd::one_shot_itimerspec(0, 1);
        let _ = fd::timerfd_settime_abs_raw(self.hrtimer_fd, &expired);

        // This may run between ticks, when the timer completion is not
        // necessarily queued on this ring.
        self.hrtimer.maybe_queue(&mut self.context);
        self.context.flush();

        while !need_preempt() {
            compiler_fence(Ordering::SeqCst);
        }
    }

    /// Clears pending quota/timer events and re-arms both watchers.
    pub(crate) fn reset_preemption_monitor(&mut self) {
        self.service_preempting_io();
        self.hrtimer.maybe_queue(&mut self.context);
        self.task_quota.maybe_queue(&mut self.context);
        self.context.flush();
    }

    /// Drains this ring's events, delivering their completions.
    pub(crate) fn service_preempting_io(&mut self) -> bool {
        let mut events = [IoEvent::zeroed(); 2];
        let n = match aio::io_getevents(
            self.context.io_context(),
            &mut events,
            self.reactor.config().force_io_getevents_syscall,
        ) {
            Ok(n) => n,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => 0,
            Err(err) => panic!("preempting io_getevents failed: {err}"),
        };
        for event in &events[..n] {
            unsafe {
                complete_from_user_data(event.data, event.res as isize);
            }
        }
        n > 0
    }
}
