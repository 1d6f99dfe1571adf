//! Per-descriptor registration state
//!
//! ```text
//!   FdTable (RwLock<Vec<Arc<FdContext>>>, indexed by fd, grow-only)
//!     └─ FdContext { fd, SpinLock<FdState> }
//!          └─ FdState { events, read: Option<EventSlot>, write: Option<EventSlot> }
//!               └─ EventSlot { scheduler, payload: Fiber | Callback }
//! ```
//!
//! A context is created on first registration and never removed. Lookups
//! take the read lock only; growth takes the write lock and rechecks.

use crate::event::{Event, EventMask};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, PoisonError, RwLock};
use weft_core::SpinLock;
use weft_runtime::fiber::Entry;
use weft_runtime::{FiberRef, Scheduler, Work};

/// What runs when an event fires
pub(crate) enum Payload {
    /// Resume the fiber that registered the event
    Fiber(FiberRef),
    Callback(Entry),
}

impl From<Payload> for Work {
    fn from(payload: Payload) -> Work {
        match payload {
            Payload::Fiber(fiber) => Work::Fiber(fiber),
            Payload::Callback(f) => Work::Callback(f),
        }
    }
}

/// A registered continuation and the scheduler it goes back to
pub(crate) struct EventSlot {
    pub scheduler: Arc<Scheduler>,
    pub payload: Payload,
}

impl EventSlot {
    /// Hand the continuation to its scheduler
    pub fn fire(self) {
        self.scheduler.schedule(self.payload);
    }
}

impl fmt::Debug for EventSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = match &self.payload {
            Payload::Fiber(fiber) => format!("Fiber({})", fiber.id()),
            Payload::Callback(_) => "Callback".to_string(),
        };
        write!(f, "EventSlot({} on {})", payload, self.scheduler.name())
    }
}

/// Registration state; `events` has a bit set exactly when its slot is `Some`
#[derive(Debug, Default)]
pub(crate) struct FdState {
    pub events: EventMask,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

impl FdState {
    pub fn slot_mut(&mut self, event: Event) -> &mut Option<EventSlot> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Install a continuation for an event not yet registered
    pub fn install(&mut self, event: Event, slot: EventSlot) {
        debug_assert!(!self.events.contains(event));
        self.events |= event;
        *self.slot_mut(event) = Some(slot);
    }

    /// Clear `event` and hand back its continuation
    pub fn take(&mut self, event: Event) -> Option<EventSlot> {
        self.events = self.events - event;
        self.slot_mut(event).take()
    }
}

pub(crate) struct FdContext {
    pub fd: RawFd,
    pub state: SpinLock<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            fd,
            state: SpinLock::new(FdState::default()),
        })
    }
}

pub(crate) struct FdTable {
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl FdTable {
    pub fn with_capacity(capacity: usize) -> Self {
        let table = Self {
            contexts: RwLock::new(Vec::new()),
        };
        table.grow_to(capacity);
        table
    }

    /// Existing context for `fd`, if the table covers it
    pub fn get(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let index = usize::try_from(fd).ok()?;
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        contexts.get(index).cloned()
    }

    /// Context for `fd`, growing the table to 1.5x `fd` when needed
    ///
    /// `fd` must be non-negative.
    pub fn get_or_grow(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.get(fd) {
            return ctx;
        }
        let index = fd as usize;
        self.grow_to((index + index / 2).max(index + 1));
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&contexts[index])
    }

    fn grow_to(&self, len: usize) {
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have grown it already
        while contexts.len() < len {
            let fd = contexts.len() as RawFd;
            contexts.push(FdContext::new(fd));
        }
    }

    pub fn len(&self) -> usize {
        self.contexts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Drop every installed continuation
    ///
    /// Continuations hold their scheduler; clearing them breaks the
    /// scheduler -> reactor -> table -> scheduler cycle.
    pub fn clear(&self) -> usize {
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = Vec::new();
        for ctx in contexts.iter() {
            let mut state = ctx.state.lock();
            for event in state.events.iter() {
                if let Some(slot) = state.take(event) {
                    dropped.push(slot);
                }
            }
        }
        drop(contexts);
        dropped.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_initial_capacity_and_growth() {
        let table = FdTable::with_capacity(4);
        assert_eq!(table.len(), 4);
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_none());
        assert!(table.get(-1).is_none());

        let ctx = table.get_or_grow(10);
        assert_eq!(ctx.fd, 10);
        assert_eq!(table.len(), 15);

        // fd 0 on an empty table still gets a context
        let empty = FdTable::with_capacity(0);
        assert_eq!(empty.get_or_grow(0).fd, 0);
    }

    #[test]
    fn test_contexts_are_stable_across_growth() {
        let table = FdTable::with_capacity(2);
        let before = table.get_or_grow(1);
        table.get_or_grow(100);
        let after = table.get(1).unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_concurrent_growth() {
        let table = Arc::new(FdTable::with_capacity(1));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let table = table.clone();
                thread::spawn(move || {
                    for fd in (i..400).step_by(4) {
                        assert_eq!(table.get_or_grow(fd).fd, fd);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for fd in 0..400 {
            assert_eq!(table.get(fd).unwrap().fd, fd);
        }
    }

    #[test]
    fn test_state_install_take() {
        let sched = Scheduler::new(1, false, "fdstate");
        let mut state = FdState::default();
        state.install(
            Event::Write,
            EventSlot {
                scheduler: sched.clone(),
                payload: Payload::Callback(Box::new(|| {})),
            },
        );
        assert_eq!(state.events, EventMask::WRITE);
        assert!(state.slot_mut(Event::Read).is_none());

        assert!(state.take(Event::Write).is_some());
        assert!(state.events.is_empty());
        assert!(state.take(Event::Write).is_none());
    }
}
