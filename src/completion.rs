//! Kernel completions.
//!
//! Every submission handed to the kernel carries an opaque `user_data`
//! word. In this crate that word is always a pointer to a [`Completion`],
//! a tagged object that knows how to consume the signed result the kernel
//! reports back. The pointee is kept alive until the kernel has delivered
//! the completion (or its cancellation has been observed); the individual
//! backends enforce that.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::pollable::PollableFdState;
use crate::shard::ReactorHandle;
use crate::sys;
use crate::sys::aio::{self, Iocb};

/// Error observed by a readiness future whose descriptor was forgotten
/// while the wait was still pending.
pub(crate) fn aborted_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "pollable file descriptor was forgotten",
    )
}

/// The object a kernel `user_data` pointer designates.
pub struct Completion {
    pub(crate) kind: CompletionKind,
    /// For completions embedded in a [`PollableFdState`], the owning
    /// state; lets reapers account in-flight kernel references back to
    /// it. Null for free-standing completions.
    owner: Cell<*const PollableFdState>,
}

pub(crate) enum CompletionKind {
    /// One-shot disk I/O callback; receives bytes transferred or `-errno`.
    Io(RefCell<Option<Box<dyn FnOnce(isize)>>>),

    /// One readiness direction of a pollable file descriptor.
    Fd(FdSlot),

    /// A re-armable poll over a timerfd or eventfd.
    Recurring(RecurringPoll),

    /// Marker for an in-flight cancellation request; the result is
    /// irrelevant, the cancelled entry's own completion does the work.
    Cancel,
}

impl Completion {
    /// Wraps a disk-I/O callback. The callback fires exactly once.
    pub fn io(callback: impl FnOnce(isize) + 'static) -> Rc<Self> {
        Rc::new(Self {
            kind: CompletionKind::Io(RefCell::new(Some(Box::new(callback)))),
            owner: Cell::new(std::ptr::null()),
        })
    }

    pub(crate) fn fd_slot() -> Self {
        Self {
            kind: CompletionKind::Fd(FdSlot::new()),
            owner: Cell::new(std::ptr::null()),
        }
    }

    pub(crate) fn recurring(fd: RawFd, role: RecurringRole) -> Rc<Self> {
        Rc::new(Self {
            kind: CompletionKind::Recurring(RecurringPoll::new(fd, role)),
            owner: Cell::new(std::ptr::null()),
        })
    }

    pub(crate) fn cancel_marker() -> Self {
        Self {
            kind: CompletionKind::Cancel,
            owner: Cell::new(std::ptr::null()),
        }
    }

    pub(crate) fn set_owner(&self, state: *const PollableFdState) {
        self.owner.set(state);
    }

    /// The descriptor state this completion is embedded in, if any.
    ///
    /// Only valid while that state is alive, which holds whenever this
    /// completion is reachable: embedded completions live inside their
    /// state.
    pub(crate) fn owner(&self) -> Option<&PollableFdState> {
        let owner = self.owner.get();
        if owner.is_null() {
            None
        } else {
            Some(unsafe { &*owner })
        }
    }

    pub(crate) fn slot(&self) -> &FdSlot {
        match &self.kind {
            CompletionKind::Fd(slot) => slot,
            _ => unreachable!("completion is not an fd slot"),
        }
    }

    pub(crate) fn recurring_poll(&self) -> &RecurringPoll {
        match &self.kind {
            CompletionKind::Recurring(poll) => poll,
            _ => unreachable!("completion is not recurring"),
        }
    }

    pub(crate) fn is_io(&self) -> bool {
        matches!(self.kind, CompletionKind::Io(_))
    }

    /// Delivers the kernel's signed result to this completion.
    pub(crate) fn complete_with(&self, res: isize) {
        match &self.kind {
            CompletionKind::Io(callback) => {
                let callback = callback
                    .borrow_mut()
                    .take()
                    .expect("io completion delivered twice");
                callback(res);
            }
            CompletionKind::Fd(slot) => {
                // -ECANCELED comes back from io_uring cancellation; the
                // forget flag covers linux-aio, where a cancelled poll's
                // event can carry any result.
                let forgotten = self.owner().is_some_and(|state| state.in_forget.get());
                if res == -libc::ECANCELED as isize || forgotten {
                    slot.abort();
                } else {
                    slot.complete();
                }
            }
            CompletionKind::Recurring(poll) => poll.complete(),
            CompletionKind::Cancel => {}
        }
    }
}

/// Resolves a reaped `user_data` back into its completion and delivers
/// `res` to it.
///
/// # Safety
///
/// `user_data` must be a pointer previously produced from a live
/// [`Completion`] whose owner keeps it alive until this call returns.
pub(crate) unsafe fn complete_from_user_data(user_data: u64, res: isize) {
    let completion = unsafe { &*(user_data as *const Completion) };
    completion.complete_with(res);
}

pub(crate) fn user_data_for(completion: &Completion) -> *const () {
    completion as *const Completion as *const ()
}

/// Promise side of a readiness wait.
///
/// One slot exists per direction on every pollable descriptor. The slot is
/// armed when a wait begins, completed or aborted exactly once by the
/// backend, and consumed by the [`CompletionFuture`] the waiter holds.
pub(crate) struct FdSlot {
    state: Cell<SlotState>,
    waker: RefCell<Option<Waker>>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SlotState {
    Idle,
    Armed,
    Ready,
    Aborted,
}

impl FdSlot {
    fn new() -> Self {
        Self {
            state: Cell::new(SlotState::Idle),
            waker: RefCell::new(None),
        }
    }

    /// Begins a new wait. Any stale waker from a previous wait is dropped.
    pub(crate) fn arm(&self) {
        self.state.set(SlotState::Armed);
        self.waker.borrow_mut().take();
    }

    pub(crate) fn complete(&self) {
        self.state.set(SlotState::Ready);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    pub(crate) fn abort(&self) {
        self.state.set(SlotState::Aborted);
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    fn poll_consume(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.state.get() {
            SlotState::Ready => {
                self.state.set(SlotState::Idle);
                Poll::Ready(Ok(()))
            }
            SlotState::Aborted => {
                self.state.set(SlotState::Idle);
                Poll::Ready(Err(aborted_error()))
            }
            _ => {
                *self.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Future returned by the readiness operations.
///
/// Resolves when the awaited direction becomes ready, or with an error if
/// the descriptor is forgotten first.
pub struct CompletionFuture {
    state: Rc<PollableFdState>,
    events: u32,
    /// Readiness was already known when the wait was requested; resolve
    /// without consulting the slot.
    immediate: bool,
}

impl CompletionFuture {
    pub(crate) fn ready(state: Rc<PollableFdState>, events: u32) -> Self {
        Self {
            state,
            events,
            immediate: true,
        }
    }

    pub(crate) fn pending(state: Rc<PollableFdState>, events: u32) -> Self {
        Self {
            state,
            events,
            immediate: false,
        }
    }
}

impl Future for CompletionFuture {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.immediate {
            return Poll::Ready(Ok(()));
        }
        self.state.completion(self.events).slot().poll_consume(cx)
    }
}

/// A poll entry that is re-armed after every delivery.
///
/// Backs the task-quota timer, the high-resolution timer and the
/// cross-shard wakeup eventfd. The entry owns a preallocated poll iocb for
/// the AIO submission paths and an `in_context` flag making
/// [`maybe_queue`](Completion::maybe_queue) idempotent between enqueueing
/// and completion.
pub(crate) struct RecurringPoll {
    iocb: UnsafeCell<Iocb>,
    in_context: Cell<bool>,
    fd: RawFd,
    role: RecurringRole,
}

pub(crate) enum RecurringRole {
    /// High-resolution timer: expirations are forwarded to the reactor's
    /// timer service.
    HrTimer(Rc<ReactorHandle>),
    /// Task-quota timer: the expiry itself is the preemption signal, the
    /// counter just needs draining.
    TaskQuota,
    /// Peer-shard wakeup eventfd.
    SmpWakeup,
    /// Eventfd signalled by storage submissions on completion; the
    /// wakeup alone matters, the reactor's next iteration does the reap.
    StorageEventfd,
}

impl RecurringPoll {
    fn new(fd: RawFd, role: RecurringRole) -> Self {
        Self {
            iocb: UnsafeCell::new(aio::make_poll_iocb(fd, sys::POLL_IN)),
            in_context: Cell::new(false),
            fd,
            role,
        }
    }

    pub(crate) fn iocb_ptr(&self) -> *mut Iocb {
        self.iocb.get()
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.in_context.get()
    }

    pub(crate) fn mark_armed(&self) {
        self.in_context.set(true);
    }

    fn complete(&self) {
        self.in_context.set(false);
        // Drain the 8-byte expiry/wakeup counter. The read may find
        // nothing: the hrtimer fd is watched by two contexts at once and
        // the other one may have consumed the expiry already.
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, 8) };
        if let RecurringRole::HrTimer(reactor) = &self.role {
            if n == 8 && u64::from_ne_bytes(buf) > 0 {
                reactor.service_highres_timer();
            }
        }
    }
}

impl Completion {
    /// Queues this recurring entry's poll iocb into `context` unless it is
    /// already pending there.
    pub(crate) fn maybe_queue(self: &Rc<Self>, context: &mut crate::aio::AioGeneralContext) {
        let poll = self.recurring_poll();
        if !poll.in_context.get() {
            poll.in_context.set(true);
            unsafe {
                aio::set_user_data(&mut *poll.iocb.get(), user_data_for(self));
            }
            context.queue(poll.iocb_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn io_completion_fires_once() {
        let fired = Rc::new(Cell::new(0));
        let observed = fired.clone();
        let completion = Completion::io(move |res| {
            observed.set(observed.get() + 1);
            assert_eq!(res, 4096);
        });
        completion.complete_with(4096);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn fd_slot_ready_then_idle() {
        let slot = FdSlot::new();
        slot.arm();
        assert_eq!(slot.state.get(), SlotState::Armed);
        slot.complete();
        assert_eq!(slot.state.get(), SlotState::Ready);
    }

    #[test]
    fn cancelled_delivery_aborts_instead_of_completing() {
        let state = PollableFdState::new(crate::sys::fd::FileDesc::eventfd(0).unwrap(), 0);
        let completion = state.completion(sys::POLL_IN);
        completion.slot().arm();
        completion.complete_with(-libc::ECANCELED as isize);
        assert_eq!(completion.slot().state.get(), SlotState::Aborted);
    }

    #[test]
    fn delivery_after_forget_aborts() {
        let state = PollableFdState::new(crate::sys::fd::FileDesc::eventfd(0).unwrap(), 0);
        let completion = state.completion(sys::POLL_IN);
        completion.slot().arm();
        state.begin_forget();
        // A racing event observed during forget must not look like
        // readiness.
        completion.complete_with(0);
        assert_eq!(completion.slot().state.get(), SlotState::Aborted);
    }
}
