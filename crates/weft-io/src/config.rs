//! Reactor configuration
//!
//! Library defaults with environment overrides, same scheme as
//! `SchedulerConfig`.

use crate::error::{IoError, IoResult};
use std::time::Duration;
use weft_core::env::{env_get, env_get_ms};

/// Events returned by one `epoll_wait`
pub const DEFAULT_MAX_EVENTS: usize = 256;

/// Longest a worker blocks in `epoll_wait` before rechecking for shutdown
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 3000;

/// Descriptor contexts preallocated at construction
pub const DEFAULT_INITIAL_FDS: usize = 32;

/// Reactor configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoConfig {
    /// Size of the per-worker event buffer
    pub max_events: usize,
    /// Upper bound on each `epoll_wait`
    pub max_timeout: Duration,
    /// Initial length of the descriptor table
    pub initial_fd_capacity: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl IoConfig {
    /// Defaults with overrides from
    /// `WEFT_IO_MAX_EVENTS`, `WEFT_IO_MAX_TIMEOUT_MS` and `WEFT_IO_INITIAL_FDS`
    pub fn from_env() -> Self {
        Self {
            max_events: env_get("WEFT_IO_MAX_EVENTS", DEFAULT_MAX_EVENTS),
            max_timeout: env_get_ms("WEFT_IO_MAX_TIMEOUT_MS", DEFAULT_MAX_TIMEOUT_MS),
            initial_fd_capacity: env_get("WEFT_IO_INITIAL_FDS", DEFAULT_INITIAL_FDS),
        }
    }

    pub fn new() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            max_timeout: Duration::from_millis(DEFAULT_MAX_TIMEOUT_MS),
            initial_fd_capacity: DEFAULT_INITIAL_FDS,
        }
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn max_timeout(mut self, d: Duration) -> Self {
        self.max_timeout = d;
        self
    }

    pub fn initial_fd_capacity(mut self, n: usize) -> Self {
        self.initial_fd_capacity = n;
        self
    }

    pub fn validate(&self) -> IoResult<()> {
        if self.max_events == 0 {
            return Err(IoError::InvalidConfig("max_events must be > 0"));
        }
        if self.max_events > i32::MAX as usize {
            return Err(IoError::InvalidConfig("max_events must fit in a C int"));
        }
        if self.max_timeout.is_zero() {
            return Err(IoError::InvalidConfig("max_timeout must be > 0"));
        }
        Ok(())
    }

    /// `max_timeout` in whole milliseconds, clamped for `epoll_wait`
    pub(crate) fn timeout_ms(&self) -> i32 {
        self.max_timeout.as_millis().clamp(1, i32::MAX as u128) as i32
    }
}

impl std::fmt::Display for IoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max_events={} max_timeout={:?} initial_fds={}",
            self.max_events, self.max_timeout, self.initial_fd_capacity
        )
    }
}
