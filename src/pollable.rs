//! Per-descriptor readiness state.

use std::cell::{Cell, UnsafeCell};
use std::rc::Rc;

use crate::completion::Completion;
use crate::sys;
use crate::sys::aio::Iocb;
use crate::sys::fd::FileDesc;

/// Readiness state the backend keeps for one user-visible descriptor.
///
/// Handed out as a reference-counted handle by
/// `Backend::make_pollable_fd_state` and destroyed through
/// `Backend::forget`, which cancels any outstanding kernel registration
/// first. The caller must route the descriptor back through `forget`
/// rather than dropping the handle, or kernel-side registrations would
/// outlive the state.
pub struct PollableFdState {
    fd: FileDesc,

    /// Readiness the user currently awaits.
    pub(crate) events_requested: Cell<u32>,

    /// Readiness already observed and not yet consumed.
    pub(crate) events_known: Cell<u32>,

    /// What is currently registered with epoll (epoll backend only).
    pub(crate) events_epoll: Cell<u32>,

    /// A single wait covers both directions (needed by `accept`, where
    /// errors surface on the opposite direction).
    pub(crate) events_rw: Cell<bool>,

    pub(crate) in_forget: Cell<bool>,

    pollin: Completion,
    pollout: Completion,

    /// Scratch control blocks for the linux-aio one-shot polls, one per
    /// direction.
    iocb_pollin: UnsafeCell<Iocb>,
    iocb_pollout: UnsafeCell<Iocb>,

    /// Target for io_uring cancellation results.
    pub(crate) cancel: Completion,

    /// io_uring submissions referencing this state that have not been
    /// reaped yet; `forget` drains to zero before freeing.
    pub(crate) kernel_refs: Cell<u32>,
}

impl PollableFdState {
    pub(crate) fn new(fd: FileDesc, speculate: u32) -> Rc<Self> {
        let state = Rc::new(Self {
            fd,
            events_requested: Cell::new(0),
            events_known: Cell::new(speculate),
            events_epoll: Cell::new(0),
            events_rw: Cell::new(false),
            in_forget: Cell::new(false),
            pollin: Completion::fd_slot(),
            pollout: Completion::fd_slot(),
            iocb_pollin: UnsafeCell::new(Iocb::zeroed()),
            iocb_pollout: UnsafeCell::new(Iocb::zeroed()),
            cancel: Completion::cancel_marker(),
            kernel_refs: Cell::new(0),
        });
        let ptr = Rc::as_ptr(&state);
        state.pollin.set_owner(ptr);
        state.pollout.set_owner(ptr);
        state.cancel.set_owner(ptr);
        state
    }

    pub fn fd(&self) -> &FileDesc {
        &self.fd
    }

    /// The completion slot serving the given direction; waits covering
    /// both directions are carried by the readable slot.
    pub(crate) fn completion(&self, events: u32) -> &Completion {
        if events & sys::POLL_IN != 0 {
            &self.pollin
        } else {
            &self.pollout
        }
    }

    pub(crate) fn iocb(&self, events: u32) -> *mut Iocb {
        if events & sys::POLL_IN != 0 {
            self.iocb_pollin.get()
        } else {
            self.iocb_pollout.get()
        }
    }

    /// Consumes already-known readiness for `events`, if any.
    pub(crate) fn take_known(&self, events: u32) -> bool {
        let known = self.events_known.get();
        if known & events != 0 {
            self.events_known.set(known & !events);
            true
        } else {
            false
        }
    }

    /// Marks the state as being dismantled: deliveries observed from here
    /// on abort their waiters instead of completing them.
    pub(crate) fn begin_forget(&self) {
        self.in_forget.set(true);
    }
}
