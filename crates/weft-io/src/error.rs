//! Error types for the reactor

use crate::event::EventMask;
use nix::errno::Errno;
use std::fmt;
use std::os::fd::RawFd;
use weft_core::SchedError;

/// Result type for reactor operations
pub type IoResult<T> = Result<T, IoError>;

/// Reactor operation failures
///
/// Registration failures leave the reactor state unchanged; the caller
/// may retry or fall back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// A system call failed
    Os(Errno),

    /// Negative file descriptor
    InvalidFd(RawFd),

    /// None of `events` is registered on `fd`
    NotRegistered { fd: RawFd, events: EventMask },

    /// Scheduler construction or startup failed
    Sched(SchedError),

    /// Invalid configuration value
    InvalidConfig(&'static str),
}

impl IoError {
    /// The operation named an fd or event with nothing registered
    pub fn is_not_registered(&self) -> bool {
        matches!(self, IoError::NotRegistered { .. })
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Os(errno) => write!(f, "system call failed: {}", errno),
            IoError::InvalidFd(fd) => write!(f, "invalid file descriptor {}", fd),
            IoError::NotRegistered { fd, events } => {
                write!(f, "fd {}: {} not registered", fd, events)
            }
            IoError::Sched(e) => write!(f, "scheduler error: {}", e),
            IoError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::Os(e) => Some(e),
            IoError::Sched(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Errno> for IoError {
    fn from(e: Errno) -> Self {
        IoError::Os(e)
    }
}

impl From<SchedError> for IoError {
    fn from(e: SchedError) -> Self {
        IoError::Sched(e)
    }
}
