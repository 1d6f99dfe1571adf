//! # weft-core
//!
//! Core types for the weft fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, stacks, worker threads and the reactor live in
//! `weft-runtime` and `weft-io`.
//!
//! ## Modules
//!
//! - `id` - Fiber and OS thread identifiers
//! - `state` - Fiber state machine and task thread affinity
//! - `error` - Error types
//! - `spinlock` - Short-critical-section lock (per-fd reactor state)
//! - `kprint` - Kernel-style leveled logging macros, `fatal!`
//! - `env` - Environment variable utilities

#![allow(dead_code)]

pub mod id;
pub mod state;
pub mod error;
pub mod spinlock;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{FiberId, Tid};
pub use state::{FiberState, FiberOutcome, ThreadAffinity};
pub use error::{FiberError, SchedError, SchedResult};
pub use spinlock::SpinLock;
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt};

/// Constants for memory layout and limits
pub mod constants {
    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
            /// Fallback page size when sysconf is unavailable
            pub const PAGE_SIZE: usize = 16 * 1024;
        } else {
            /// Fallback page size when sysconf is unavailable
            pub const PAGE_SIZE: usize = 4096;
        }
    }

    /// Guard pages below each fiber stack
    pub const GUARD_PAGES: usize = 1;

    /// Smallest usable fiber stack
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Largest fiber stack accepted by config validation (1 GiB)
    pub const MAX_STACK_SIZE: usize = 1 << 30;

    /// Fiber id reported when the thread has no fiber yet
    pub const FIBER_NONE: u64 = 0;
}
