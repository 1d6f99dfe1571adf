//! Fiber state and task affinity types

use core::fmt;
use crate::id::Tid;

/// State of a fiber
///
/// ```text
///   Init ──resume──▶ Exec ──yield──▶ Ready | Hold ──resume──▶ Exec ...
///                     │
///                     └──return──▶ Term      (body returned)
///                     └──panic───▶ Except    (body panicked)
/// ```
///
/// Only `Init`, `Term` and `Except` allow the stack to be reset or freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, not yet started
    Init = 0,

    /// Suspended; must be re-submitted to run again
    Hold = 1,

    /// Currently executing on some thread's CPU
    Exec = 2,

    /// Body returned normally
    Term = 3,

    /// Suspended and asking to be re-queued
    Ready = 4,

    /// Body panicked
    Except = 5,
}

impl FiberState {
    /// Check if the fiber can never run again (without a reset)
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Check if the fiber's stack may be reset or released
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }

    /// Check if the fiber may be resumed
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Hold | FiberState::Ready)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Hold,
            2 => FiberState::Exec,
            3 => FiberState::Term,
            4 => FiberState::Ready,
            _ => FiberState::Except,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Init => write!(f, "INIT"),
            FiberState::Hold => write!(f, "HOLD"),
            FiberState::Exec => write!(f, "EXEC"),
            FiberState::Term => write!(f, "TERM"),
            FiberState::Ready => write!(f, "READY"),
            FiberState::Except => write!(f, "EXCEPT"),
        }
    }
}

/// How a fiber body ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberOutcome {
    /// The body returned
    Completed,
    /// The body panicked with this message
    Panicked(String),
}

impl FiberOutcome {
    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self, FiberOutcome::Completed)
    }

    /// The state a fiber lands in for this outcome
    #[inline]
    pub fn terminal_state(&self) -> FiberState {
        match self {
            FiberOutcome::Completed => FiberState::Term,
            FiberOutcome::Panicked(_) => FiberState::Except,
        }
    }
}

/// Which worker thread may run a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadAffinity {
    /// Any worker of the scheduler
    #[default]
    Any,
    /// Only the worker whose kernel thread id matches
    Pinned(Tid),
}

impl ThreadAffinity {
    /// Check if a worker running on `tid` may claim the task
    #[inline]
    pub fn admits(&self, tid: Tid) -> bool {
        match self {
            ThreadAffinity::Any => true,
            ThreadAffinity::Pinned(t) => *t == tid,
        }
    }
}

impl From<Tid> for ThreadAffinity {
    fn from(tid: Tid) -> Self {
        ThreadAffinity::Pinned(tid)
    }
}

impl From<Option<Tid>> for ThreadAffinity {
    fn from(tid: Option<Tid>) -> Self {
        match tid {
            Some(t) => ThreadAffinity::Pinned(t),
            None => ThreadAffinity::Any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Term.is_terminal());
        assert!(FiberState::Except.is_terminal());
        assert!(!FiberState::Hold.is_terminal());

        assert!(FiberState::Init.is_resettable());
        assert!(FiberState::Term.is_resettable());
        assert!(!FiberState::Exec.is_resettable());
        assert!(!FiberState::Ready.is_resettable());

        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
        assert!(!FiberState::Except.is_resumable());
    }

    #[test]
    fn test_state_u8_roundtrip_covers_all() {
        for v in 0u8..6 {
            assert_eq!(u8::from(FiberState::from(v)), v);
        }
    }

    #[test]
    fn test_outcome_terminal_state() {
        assert_eq!(FiberOutcome::Completed.terminal_state(), FiberState::Term);
        assert_eq!(
            FiberOutcome::Panicked("boom".into()).terminal_state(),
            FiberState::Except
        );
    }

    #[test]
    fn test_affinity_admits() {
        let a = Tid::new(10);
        let b = Tid::new(11);
        assert!(ThreadAffinity::Any.admits(a));
        assert!(ThreadAffinity::Pinned(a).admits(a));
        assert!(!ThreadAffinity::Pinned(a).admits(b));
        assert_eq!(ThreadAffinity::from(None), ThreadAffinity::Any);
    }
}
