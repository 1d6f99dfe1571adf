//! Error types for the weft runtime

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Misuse of the fiber state machine
///
/// `Fiber::resume` / `Fiber::reset` treat every one of these as fatal;
/// the `try_` variants hand them back instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberError {
    /// Fiber is already running on some thread
    AlreadyExecuting,

    /// Fiber finished (Term/Except) and was not reset
    Terminated,

    /// Operation is not valid on a thread main fiber
    MainFiber,

    /// Reset requested while the fiber is Exec, Hold or Ready
    NotResettable,

    /// Stack mapping failed (errno)
    StackAllocation(i32),
}

impl fmt::Display for FiberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberError::AlreadyExecuting => write!(f, "fiber is already executing"),
            FiberError::Terminated => write!(f, "fiber has terminated"),
            FiberError::MainFiber => write!(f, "operation not valid on a thread main fiber"),
            FiberError::NotResettable => write!(f, "fiber is not in a resettable state"),
            FiberError::StackAllocation(errno) => {
                write!(f, "fiber stack allocation failed (errno {})", errno)
            }
        }
    }
}

impl std::error::Error for FiberError {}

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// `start()` called while workers are running
    AlreadyStarted,

    /// Operation needs a started scheduler
    NotStarted,

    /// Operation must run on a specific thread (e.g. the caller thread)
    WrongThread,

    /// Failed to spawn a worker thread
    Spawn(String),

    /// Invalid configuration value
    InvalidConfig(&'static str),

    /// Fiber state machine error
    Fiber(FiberError),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::NotStarted => write!(f, "scheduler not started"),
            SchedError::WrongThread => write!(f, "called from the wrong thread"),
            SchedError::Spawn(msg) => write!(f, "failed to spawn worker thread: {}", msg),
            SchedError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            SchedError::Fiber(e) => write!(f, "fiber error: {}", e),
        }
    }
}

impl std::error::Error for SchedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchedError::Fiber(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FiberError> for SchedError {
    fn from(e: FiberError) -> Self {
        SchedError::Fiber(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::AlreadyStarted;
        assert_eq!(format!("{}", e), "scheduler already started");

        let e = SchedError::Fiber(FiberError::AlreadyExecuting);
        assert_eq!(format!("{}", e), "fiber error: fiber is already executing");
    }

    #[test]
    fn test_error_conversion() {
        let fiber_err = FiberError::StackAllocation(12);
        let sched_err: SchedError = fiber_err.into();
        assert!(matches!(
            sched_err,
            SchedError::Fiber(FiberError::StackAllocation(12))
        ));
        assert!(std::error::Error::source(&sched_err).is_some());
    }
}
