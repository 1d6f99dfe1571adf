//! # weft-io
//!
//! Edge-triggered epoll reactor on top of the weft scheduler. Fibers
//! register interest in a descriptor, yield, and are rescheduled when it
//! becomes ready; idle workers are the ones sitting in `epoll_wait`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Fiber code                                      │
//! │   iom.add_event(fd, Event::Read)?                        │
//! │   Fiber::yield_to_hold()    ← worker runs other fibers   │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │ FdContext slot (fiber or callback)
//!                    ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         Reactor (SchedulerHooks)                         │
//! │   idle:    epoll_wait ─ rearm ─ schedule continuation    │
//! │   tickle:  write self-pipe if a worker is idle           │
//! │   stopping: base condition && no pending registrations  │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │
//! ┌──────────────────▼──────────────────────────────────────┐
//! │         Scheduler (weft-runtime)                         │
//! │   shared queue ─ N workers (+ optional caller thread)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft_io::{Event, IoManager};
//! use weft_runtime::Fiber;
//!
//! let iom = IoManager::new(4, false, "io")?;
//! iom.schedule_fn(move || {
//!     let io = IoManager::current().unwrap();
//!     io.add_event(fd, Event::Read).unwrap();
//!     Fiber::yield_to_hold();
//!     // fd is readable here
//! });
//! ```
//!
//! Only Linux is supported.

#[cfg(not(target_os = "linux"))]
compile_error!("weft-io requires epoll (Linux)");

pub mod config;
pub mod error;
pub mod event;
pub mod iomanager;

mod fd_table;
mod poller;
mod reactor;
mod waker;

pub use config::IoConfig;
pub use error::{IoError, IoResult};
pub use event::{Event, EventMask};
pub use iomanager::IoManager;
