//! Bulk-submission AIO ring for non-storage work.

use std::io;

use crate::preempt::need_preempt;
use crate::sys::aio::{self, AioContext, Iocb};

/// An AIO context used for readiness polls and timer/eventfd waits.
///
/// Control blocks are queued into a bounded batch and pushed to the
/// kernel in one `io_submit` per [`flush`](Self::flush).
pub(crate) struct AioGeneralContext {
    io_context: AioContext,
    queued: Vec<*mut Iocb>,
    capacity: usize,
}

impl AioGeneralContext {
    pub(crate) fn new(nr: usize) -> io::Result<Self> {
        let mut io_context: AioContext = 0;
        aio::io_setup(nr, &mut io_context)?;
        Ok(Self {
            io_context,
            queued: Vec::with_capacity(nr),
            capacity: nr,
        })
    }

    pub(crate) fn io_context(&self) -> AioContext {
        self.io_context
    }

    /// Appends a control block to the pending batch.
    pub(crate) fn queue(&mut self, iocb: *mut Iocb) {
        assert!(
            self.queued.len() < self.capacity,
            "aio context over capacity"
        );
        self.queued.push(iocb);
    }

    /// Submits the pending batch until the kernel has accepted all of it.
    ///
    /// `EAGAIN` is expected when the ring is transiently full and the
    /// submit is simply retried. A progress check runs whenever
    /// preemption asserts, so a persistently failing submit cannot spin
    /// forever.
    pub(crate) fn flush(&mut self) -> usize {
        let total = self.queued.len();
        let mut begin = 0;
        let mut checkpoint = usize::MAX;
        while begin < total {
            match aio::io_submit(self.io_context, &mut self.queued[begin..total]) {
                Ok(n) => begin += n,
                Err(err) => {
                    if need_preempt() {
                        assert!(
                            begin != checkpoint,
                            "io_submit makes no progress: {err}"
                        );
                        checkpoint = begin;
                    }
                }
            }
        }
        self.queued.clear();
        total
    }

    /// Asks the kernel to cancel an in-flight control block.
    ///
    /// Failure is fine: the block may have completed already, in which
    /// case its event is (or will be) in the ring.
    pub(crate) fn cancel(&mut self, iocb: *mut Iocb) {
        let _ = aio::io_cancel(self.io_context, iocb);
    }
}

impl Drop for AioGeneralContext {
    fn drop(&mut self) {
        aio::io_destroy(self.io_context);
    }
}
