//! # weft-runtime
//!
//! Platform-specific runtime for weft fibers.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Guarded fiber stacks (mmap)
//! - `Fiber`, the stackful coroutine
//! - `Scheduler`, N:M scheduling over a worker thread pool
//! - Worker thread management and parking

pub mod arch;
pub mod config;
pub mod fiber;
pub mod hooks;
pub mod memory;
pub mod parking;
pub mod scheduler;
pub mod tls;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod test_support;

// Re-exports
pub use config::SchedulerConfig;
pub use fiber::{Fiber, FiberRef};
pub use hooks::{ParkingHooks, SchedulerHooks};
pub use parking::{new_parking, WorkerParking};
pub use scheduler::{Scheduler, SchedulerSwitch, Work};
pub use tls::current_tid;

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))] {
        compile_error!("Unsupported architecture");
    } else if #[cfg(not(unix))] {
        compile_error!("Unsupported platform");
    }
}
