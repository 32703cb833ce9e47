//! # Stratum
//!
//! **Stratum** is the pluggable kernel I/O backend layer for
//! shard-per-core reactors on Linux: one OS thread pinned to one CPU,
//! one reactor per thread, and underneath it one backend that submits
//! file and network I/O to the kernel, reaps completions, delivers timer
//! and cross-shard wakeups, and forces long-running cooperative tasks to
//! yield.
//!
//! Three interchangeable backends share a single [`Backend`] contract:
//!
//! - **linux-aio** — the native AIO interface serves disk I/O, fd
//!   readiness (`IOCB_CMD_POLL`) and timer/eventfd waits, giving one
//!   unified kernel-wait path
//! - **epoll** — `epoll_pwait` readiness plus a helper thread for
//!   precise quota ticks, with disk I/O still on linux-aio
//! - **io_uring** — one ring for all of the above (`uring` feature)
//!
//! Capability detection picks the best backend for the host at runtime;
//! see [`BackendSelector`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stratum::{BackendConfig, BackendSelector, ReactorHandle};
//!
//! let reactor = ReactorHandle::new(BackendConfig::new())?;
//! let backend = BackendSelector::default_backend(1).create(reactor.clone())?;
//!
//! // The reactor's iteration, reduced to its essentials:
//! loop {
//!     backend.kernel_submit_work();
//!     backend.reap_kernel_completions();
//!     // ... run ready tasks; when there is nothing to do:
//!     if backend.kernel_events_can_sleep() {
//!         backend.wait_and_process_events(None);
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`io`] — awaitable accept/connect/read/write over any backend
//! - [`need_preempt`] — the hot-path yield check for cooperative tasks

mod aio;
mod backend;
mod completion;
mod pollable;
mod preempt;
mod request;
mod shard;
mod sys;

pub use backend::io;
pub use backend::{AioBackend, Backend, BackendSelector, EpollBackend};
#[cfg(feature = "uring")]
pub use backend::UringBackend;
pub use completion::{Completion, CompletionFuture};
pub use pollable::PollableFdState;
pub use preempt::need_preempt;
pub use request::IoRequest;
pub use shard::{BackendConfig, IoSink, IoStats, ReactorHandle, SpawningThreadPool, ThreadPool};
pub use sys::fd::FileDesc;
pub use sys::{POLL_IN, POLL_OUT};
