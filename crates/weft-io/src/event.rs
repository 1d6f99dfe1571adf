//! Readiness event vocabulary
//!
//! `Event` is one direction, `EventMask` a set of them. The bit values are
//! the epoll ones so a mask goes to `epoll_ctl` unchanged.

use std::fmt;
use std::ops::{BitOr, BitOrAssign, Sub};

/// A single readiness direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Event {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
}

impl Event {
    /// Both events, in firing order
    pub const ALL: [Event; 2] = [Event::Read, Event::Write];

    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Read => write!(f, "READ"),
            Event::Write => write!(f, "WRITE"),
        }
    }
}

/// Set of events registered on (or reported for) a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(Event::Read.bits());
    pub const WRITE: EventMask = EventMask(Event::Write.bits());
    pub const ALL: EventMask = EventMask(Event::Read.bits() | Event::Write.bits());

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bits() != 0
    }

    #[inline]
    pub fn intersect(self, other: EventMask) -> EventMask {
        EventMask(self.0 & other.0)
    }

    /// Translate an `epoll_wait` report into events
    ///
    /// Error and hangup count as both directions: a waiter on either side
    /// must wake up to observe the failure.
    pub fn from_epoll(flags: u32) -> EventMask {
        let mut mask = EventMask(flags & EventMask::ALL.0);
        if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            mask = EventMask::ALL;
        }
        mask
    }

    /// Events in the mask, in firing order
    pub fn iter(self) -> impl Iterator<Item = Event> {
        Event::ALL.into_iter().filter(move |e| self.contains(*e))
    }
}

impl From<Event> for EventMask {
    fn from(event: Event) -> Self {
        EventMask(event.bits())
    }
}

impl BitOr<Event> for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: Event) -> EventMask {
        EventMask(self.0 | rhs.bits())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign<Event> for EventMask {
    fn bitor_assign(&mut self, rhs: Event) {
        self.0 |= rhs.bits();
    }
}

impl Sub<Event> for EventMask {
    type Output = EventMask;
    fn sub(self, rhs: Event) -> EventMask {
        EventMask(self.0 & !rhs.bits())
    }
}

impl Sub for EventMask {
    type Output = EventMask;
    fn sub(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & !rhs.0)
    }
}

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        for (i, event) in self.iter().enumerate() {
            if i > 0 {
                write!(f, "|")?;
            }
            write!(f, "{}", event)?;
        }
        Ok(())
    }
}
