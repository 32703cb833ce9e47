//! The backend contract and its implementations.
//!
//! A backend is the reactor's window to the kernel: it submits file and
//! network I/O, reaps completions, delivers timer and cross-shard
//! wakeups, and drives task preemption. Three interchangeable
//! implementations exist; consumers observe nothing beyond performance.

mod aio;
mod epoll;
pub mod io;
mod selector;
#[cfg(feature = "uring")]
mod uring;

pub use aio::AioBackend;
pub use epoll::EpollBackend;
pub use selector::BackendSelector;
#[cfg(feature = "uring")]
pub use uring::UringBackend;

use std::os::fd::RawFd;
use std::rc::Rc;

use crate::completion::CompletionFuture;
use crate::pollable::PollableFdState;
use crate::sys::fd::FileDesc;

/// Operations the reactor drives on every iteration.
///
/// The `bool`-returning methods answer "did any useful work?", which the
/// reactor uses to decide whether it may go to sleep.
pub trait Backend {
    /// Reaps ready kernel completions without blocking.
    fn reap_kernel_completions(&self) -> bool;

    /// Drains pending I/O to the kernel.
    fn kernel_submit_work(&self) -> bool;

    /// True when blocking in [`wait_and_process_events`](Self::wait_and_process_events)
    /// cannot strand in-flight work.
    fn kernel_events_can_sleep(&self) -> bool;

    /// Blocks until the kernel has something for this shard, with
    /// `active_sigmask` installed for the duration of the wait.
    fn wait_and_process_events(&self, active_sigmask: Option<&libc::sigset_t>);

    /// Waits for the descriptor to become readable.
    fn readable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture;

    /// Waits for the descriptor to become writeable.
    fn writeable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture;

    /// Waits for either direction with a single future; `accept` needs
    /// this because peer shutdown surfaces on the write side.
    fn readable_or_writeable(&self, fd: &Rc<PollableFdState>) -> CompletionFuture;

    /// Dissociates the descriptor from the backend and releases its
    /// state. Outstanding kernel registrations are cancelled first, and
    /// any still-pending readiness future resolves as aborted.
    ///
    /// The caller's handle is consumed; this must be the last handle the
    /// reactor holds.
    fn forget(&self, fd: Rc<PollableFdState>);

    fn shutdown(&self, fd: &PollableFdState, how: libc::c_int);

    /// Arms the high-resolution timer with an absolute deadline.
    fn arm_highres_timer(&self, its: &libc::itimerspec);

    /// Starts quota ticking and installs this backend's preemption
    /// monitor.
    fn start_tick(&self);

    /// Stops quota ticking and restores the reactor's software monitor.
    fn stop_tick(&self);

    /// Forces the preemption flag on; `need_preempt` reads true on this
    /// shard within a bounded wait.
    fn request_preemption(&self);

    /// Clears stale quota state and re-arms the preemption watchers.
    fn reset_preemption_monitor(&self);

    /// Invoked when the reactor begins handling a signal.
    fn start_handling_signal(&self);

    /// Routes a received signal to the reactor's registered action.
    fn signal_received(&self, signo: i32);

    /// Wraps an owned descriptor into backend-managed readiness state.
    /// `speculate` seeds `events_known` with readiness assumed present.
    fn make_pollable_fd_state(&self, fd: FileDesc, speculate: u32) -> Rc<PollableFdState>;
}

/// Raw accessor used by the I/O helpers.
pub(crate) fn state_fd(state: &PollableFdState) -> RawFd {
    state.fd().raw()
}
