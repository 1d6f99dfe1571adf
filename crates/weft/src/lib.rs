//! # weft - fibers woven over OS threads
//!
//! Stackful coroutines, an N:M scheduler with thread affinity, and an
//! edge-triggered epoll reactor that parks fibers on file descriptors.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{Event, Fiber, IoManager};
//!
//! fn main() -> weft::IoResult<()> {
//!     let iom = IoManager::new(4, false, "main")?;
//!
//!     iom.schedule_fn(move || {
//!         let io = IoManager::current().unwrap();
//!         io.add_event(fd, Event::Read).unwrap();
//!         Fiber::yield_to_hold();
//!         // readable
//!     });
//!
//!     iom.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │      schedule(), Fiber::yield_*, add_event(fd, ev)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                IoManager (weft-io)                          │
//! │      per-fd contexts, epoll idle loop, self-pipe tickle     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Scheduler (weft-runtime)                     │
//! │      FIFO queue with affinity, root fiber on the caller     │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │  Thread   │
//!    └───────────┘      └───────────┘      └───────────┘
//!                              │
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                  Fibers                                 │
//!    │     mmap'd stacks with guard page, asm context switch   │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use weft_core::{
    FiberError,
    FiberId,
    FiberOutcome,
    FiberState,
    SchedError,
    SchedResult,
    ThreadAffinity,
    Tid,
};

// Re-export kprint macros for debug logging
pub use weft_core::{fatal, fatal_assert, kdebug, kerror, kinfo, kprint, kprintln, ktrace, kwarn};
pub use weft_core::kprint::{init as init_logging, set_flush_enabled, set_log_level, LogLevel};

// Re-export env utilities
pub use weft_core::{env_get, env_get_bool, env_get_ms, env_get_opt};

// Re-export runtime types
pub use weft_runtime::{
    current_tid,
    Fiber,
    FiberRef,
    Scheduler,
    SchedulerConfig,
    SchedulerHooks,
    SchedulerSwitch,
    Work,
};

// Re-export reactor types
pub use weft_io::{Event, EventMask, IoConfig, IoError, IoManager, IoResult};

/// Queue `f` on the scheduler driving this thread
///
/// Fails with `WrongThread` outside a scheduler's threads.
pub fn spawn<F>(f: F) -> SchedResult<()>
where
    F: FnOnce() + Send + 'static,
{
    let scheduler = Scheduler::current().ok_or(SchedError::WrongThread)?;
    scheduler.schedule_fn(f);
    Ok(())
}

/// Let other queued work run; this fiber is requeued behind it
pub fn yield_now() {
    Fiber::yield_to_ready();
}
