//! Edge-triggered epoll reactor
//!
//! The reactor is the scheduler's idle behavior. Each worker with nothing
//! to run sits in `epoll_wait` on the shared poller; readiness moves the
//! registered continuations back onto their scheduler.
//!
//! ```text
//!   fiber / caller                       idle worker
//!   ─────────────                        ───────────
//!   add_event(fd, Read)                  epoll_wait(timeout)
//!     lock fd ─ epoll_ctl ─ install          │
//!   Fiber::yield_to_hold()                   ▼  fd readable
//!        ⋮                               lock fd ─ rearm ─ take slot
//!        ⋮  ◄──────── schedule ───────── slot.fire()
//!   resumes on some worker               Fiber::yield_to_hold()
//! ```
//!
//! Each registration is one-shot: firing, deleting and cancelling all
//! clear the event from the interest set. `pending` counts installed
//! continuations; the scheduler may only stop once it reaches zero.

use crate::config::IoConfig;
use crate::error::{IoError, IoResult};
use crate::event::{Event, EventMask};
use crate::fd_table::{EventSlot, FdContext, FdState, FdTable, Payload};
use crate::iomanager::IoManager;
use crate::poller::{event_buffer, Poller};
use crate::waker::Waker;
use nix::errno::Errno;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use weft_core::{fatal, fatal_assert, kdebug, kerror, ktrace};
use weft_runtime::{Fiber, Scheduler, SchedulerHooks};

/// Field order is teardown order: the epoll fd closes first, then both
/// pipe ends, then the fd contexts are released.
pub(crate) struct Reactor {
    poller: Poller,
    waker: Waker,
    fds: FdTable,
    pending: AtomicUsize,
    config: IoConfig,
    owner: OnceLock<Weak<IoManager>>,
}

impl Reactor {
    pub fn new(config: IoConfig) -> IoResult<Self> {
        config.validate()?;
        let poller = Poller::new()?;
        let waker = Waker::new()?;
        poller.add(waker.read_fd(), EventMask::READ)?;
        kdebug!(
            "reactor up: epfd={} waker={} ({})",
            poller.as_raw_fd(),
            waker.read_fd(),
            config
        );
        Ok(Self {
            fds: FdTable::with_capacity(config.initial_fd_capacity),
            poller,
            waker,
            pending: AtomicUsize::new(0),
            config,
            owner: OnceLock::new(),
        })
    }

    /// Record the IoManager this reactor serves; later calls are ignored
    pub fn set_owner(&self, owner: Weak<IoManager>) {
        let _ = self.owner.set(owner);
    }

    pub fn owner(&self) -> Option<Arc<IoManager>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Epoll fd, then the waker's read and write ends
    #[cfg(test)]
    pub fn raw_fds(&self) -> [RawFd; 3] {
        [self.poller.as_raw_fd(), self.waker.read_fd(), self.waker.write_fd()]
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn fd_capacity(&self) -> usize {
        self.fds.len()
    }

    /// Register interest in `event` on `fd`
    ///
    /// The continuation goes back to the scheduler of the registering
    /// thread, or `owner` when the thread has none.
    pub fn add_event(
        &self,
        owner: &Arc<Scheduler>,
        fd: RawFd,
        event: Event,
        payload: Payload,
    ) -> IoResult<()> {
        if fd < 0 {
            return Err(IoError::InvalidFd(fd));
        }
        let ctx = self.fds.get_or_grow(fd);
        let mut state = ctx.state.lock();
        if state.events.contains(event) {
            fatal!(
                "add_event fd={} event={}: already registered (events={})",
                fd,
                event,
                state.events
            );
        }

        let wanted = state.events | event;
        let ret = if state.events.is_empty() {
            self.poller.add(fd, wanted)
        } else {
            self.poller.modify(fd, wanted)
        };
        if let Err(e) = ret {
            kerror!("add_event fd={} event={}: epoll_ctl failed: {}", fd, event, e);
            return Err(IoError::Os(e));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        let scheduler = Scheduler::current().unwrap_or_else(|| Arc::clone(owner));
        state.install(event, EventSlot { scheduler, payload });
        ktrace!("add_event fd={} events={}", fd, state.events);
        Ok(())
    }

    /// Remove `event` from `fd` without running its continuation
    pub fn del_event(&self, fd: RawFd, event: Event) -> IoResult<()> {
        let ctx = self.context(fd, event.into())?;
        let mut state = ctx.state.lock();
        if !state.events.contains(event) {
            return Err(IoError::NotRegistered { fd, events: event.into() });
        }
        self.rearm(&ctx, state.events - event)?;
        let slot = state.take(event);
        drop(state);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        // Released outside the lock; dropping a fiber may log
        drop(slot);
        Ok(())
    }

    /// Remove `event` from `fd` and run its continuation once
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> IoResult<()> {
        let ctx = self.context(fd, event.into())?;
        let mut state = ctx.state.lock();
        if !state.events.contains(event) {
            return Err(IoError::NotRegistered { fd, events: event.into() });
        }
        self.rearm(&ctx, state.events - event)?;
        self.fire(&mut state, event);
        Ok(())
    }

    /// Deregister `fd` and run every continuation on it once
    pub fn cancel_all(&self, fd: RawFd) -> IoResult<()> {
        let ctx = self.context(fd, EventMask::ALL)?;
        let mut state = ctx.state.lock();
        if state.events.is_empty() {
            return Err(IoError::NotRegistered { fd, events: EventMask::ALL });
        }
        self.rearm(&ctx, EventMask::NONE)?;
        for event in state.events.iter() {
            self.fire(&mut state, event);
        }
        fatal_assert!(state.events.is_empty(), "cancel_all left events on fd {}", fd);
        Ok(())
    }

    /// Drop all continuations without running them
    ///
    /// Continuations hold their scheduler, so any left over keep the
    /// scheduler and this reactor alive until cleared.
    pub fn clear(&self) {
        let dropped = self.fds.clear();
        if dropped > 0 {
            self.pending.fetch_sub(dropped, Ordering::SeqCst);
            kdebug!("reactor dropped {} unfired continuations", dropped);
        }
    }

    /// Context of a descriptor the table already covers
    fn context(&self, fd: RawFd, events: EventMask) -> IoResult<Arc<FdContext>> {
        self.fds.get(fd).ok_or(IoError::NotRegistered { fd, events })
    }

    fn rearm(&self, ctx: &FdContext, remaining: EventMask) -> IoResult<()> {
        self.poller.rearm(ctx.fd, remaining).map_err(|e| {
            kerror!("rearm fd={} to {}: epoll_ctl failed: {}", ctx.fd, remaining, e);
            IoError::Os(e)
        })
    }

    /// Schedule the continuation for `event`; caller holds the fd lock
    fn fire(&self, state: &mut FdState, event: Event) {
        let Some(slot) = state.take(event) else {
            fatal!("event {} marked but has no continuation", event);
        };
        slot.fire();
        // After the push: the queue is non-empty before pending drops
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// Dispatch one readiness report
    fn dispatch(&self, fd: RawFd, flags: u32) {
        let Some(ctx) = self.fds.get(fd) else {
            return;
        };
        let mut state = ctx.state.lock();
        let fired = EventMask::from_epoll(flags).intersect(state.events);
        if fired.is_empty() {
            return;
        }
        if self.rearm(&ctx, state.events - fired).is_err() {
            return;
        }
        for event in fired.iter() {
            self.fire(&mut state, event);
        }
    }
}

impl SchedulerHooks for Reactor {
    /// Interrupt one `epoll_wait`, only if some worker is in it
    fn tickle(&self, scheduler: &Scheduler) {
        if scheduler.has_idle_threads() {
            self.waker.wake();
        }
    }

    fn idle(&self, scheduler: &Scheduler) {
        let mut events = event_buffer(self.config.max_events);
        let waker_fd = self.waker.read_fd();
        let timeout_ms = self.config.timeout_ms();

        loop {
            if scheduler.stopping() {
                kdebug!("scheduler {} idle exits", scheduler.name());
                break;
            }

            let n = loop {
                match self.poller.wait(&mut events, timeout_ms) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        kerror!("epoll_wait failed: {}", e);
                        break 0;
                    }
                }
            };

            for ev in &events[..n] {
                // Copy out of the (packed on x86_64) struct
                let (flags, data) = (ev.events, ev.u64);
                let fd = data as RawFd;
                if fd == waker_fd {
                    self.waker.drain();
                } else {
                    self.dispatch(fd, flags);
                }
            }

            Fiber::yield_to_hold();
        }
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.base_stopping() && self.pending() == 0
    }
}
