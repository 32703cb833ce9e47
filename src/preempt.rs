//! The preemption monitor.
//!
//! Cooperative tasks call [`need_preempt`] at their yield points. The read
//! must be as cheap as possible, so it goes through a per-shard pointer
//! that the active backend aims at whichever memory the kernel (or a
//! helper thread) bumps when the task quota expires:
//!
//! - the linux-aio backends alias it onto the completion counter of a
//!   dedicated AIO ring, which the kernel increments out of band;
//! - the epoll backend points it at a reactor-owned word written by the
//!   timer helper thread.
//!
//! Reader and writer are pinned to the same CPU, so relaxed loads plus a
//! compiler fence are all the ordering this needs.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering, compiler_fence};

/// A head/tail counter pair; preemption is requested while the two differ.
///
/// The layout mirrors the head/tail words of the kernel's AIO completion
/// ring so a monitor reference can alias either memory.
#[repr(C)]
pub struct PreemptionMonitor {
    pub(crate) head: AtomicU32,
    pub(crate) tail: AtomicU32,
}

impl PreemptionMonitor {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }
}

/// Monitor observed before any backend has installed one.
static IDLE_MONITOR: PreemptionMonitor = PreemptionMonitor::new();

thread_local! {
    static NEED_PREEMPT: Cell<*const PreemptionMonitor> =
        Cell::new(&IDLE_MONITOR as *const PreemptionMonitor);
}

/// Points this shard's preemption checks at `monitor`.
///
/// Installations are scoped: `start_tick` switches to the backend's
/// monitor, `stop_tick` switches back to the reactor-owned word.
pub(crate) fn set_need_preempt_var(monitor: *const PreemptionMonitor) {
    NEED_PREEMPT.with(|p| p.set(monitor));
}

/// True when the current task should yield at its next opportunity.
#[inline]
pub fn need_preempt() -> bool {
    NEED_PREEMPT.with(|p| {
        let monitor = p.get();
        compiler_fence(Ordering::SeqCst);
        let monitor = unsafe { &*monitor };
        let head = monitor.head.load(Ordering::Relaxed);
        let tail = monitor.tail.load(Ordering::Relaxed);
        head != tail
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn idle_monitor_never_preempts() {
        set_need_preempt_var(&IDLE_MONITOR);
        assert!(!need_preempt());
    }

    #[test]
    fn monitor_fires_while_counters_differ() {
        let monitor = Box::new(PreemptionMonitor::new());
        set_need_preempt_var(&*monitor);
        assert!(!need_preempt());

        monitor.head.store(1, Ordering::Relaxed);
        assert!(need_preempt());

        monitor.head.store(0, Ordering::Relaxed);
        assert!(!need_preempt());
        set_need_preempt_var(&IDLE_MONITOR);
    }
}
