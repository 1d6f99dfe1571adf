//! Scheduler + reactor composition

use crate::config::IoConfig;
use crate::error::IoResult;
use crate::event::Event;
use crate::fd_table::Payload;
use crate::reactor::Reactor;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;
use weft_core::{fatal_assert, kdebug, kerror, kinfo, kwarn};
use weft_runtime::{Fiber, Scheduler, SchedulerConfig};

/// A scheduler whose idle workers wait on epoll
///
/// Construction starts the workers and hands back a shared handle; tasks
/// reach the same handle through [`IoManager::current`]. Dropping the last
/// handle stops the scheduler (which waits for every registered event to
/// fire or be cancelled), closes the poller and the wake pipe, then
/// releases the fd contexts. With `include_caller_thread`, stop and the
/// final drop must happen on the constructing thread.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Configuration from the environment; invalid values fall back to
    /// the built-in defaults
    pub fn new(worker_count: usize, include_caller_thread: bool, name: &str) -> IoResult<Arc<Self>> {
        let sched_config = SchedulerConfig::from_env();
        let sched_config = match sched_config.validate() {
            Ok(()) => sched_config,
            Err(e) => {
                kwarn!("{}; using built-in scheduler defaults", e);
                SchedulerConfig::new()
            }
        };
        let io_config = IoConfig::from_env();
        let io_config = match io_config.validate() {
            Ok(()) => io_config,
            Err(e) => {
                kwarn!("{}; using built-in reactor defaults", e);
                IoConfig::new()
            }
        };
        Self::with_config(worker_count, include_caller_thread, name, sched_config, io_config)
    }

    pub fn with_config(
        worker_count: usize,
        include_caller_thread: bool,
        name: &str,
        sched_config: SchedulerConfig,
        io_config: IoConfig,
    ) -> IoResult<Arc<Self>> {
        let reactor = Arc::new(Reactor::new(io_config)?);
        let scheduler = Scheduler::with_hooks(
            worker_count,
            include_caller_thread,
            name,
            sched_config,
            reactor.clone(),
        )?;
        let iom = Arc::new(Self { scheduler, reactor });
        iom.reactor.set_owner(Arc::downgrade(&iom));
        iom.scheduler.start()?;
        kinfo!("io manager {} started", name);
        Ok(iom)
    }

    /// IoManager whose scheduler drives the current thread
    ///
    /// Set on every worker for the lifetime of its run loop, and on the
    /// constructing thread with `include_caller_thread`. `None` elsewhere,
    /// including inside tasks of a plain `Scheduler`.
    pub fn current() -> Option<Arc<IoManager>> {
        let scheduler = Scheduler::current()?;
        let hooks: &dyn Any = &**scheduler.hooks();
        hooks.downcast_ref::<Reactor>()?.owner()
    }

    /// Suspend-and-resume registration for the running fiber
    ///
    /// When `event` fires on `fd` the fiber is rescheduled. The caller
    /// normally follows up with `Fiber::yield_to_hold()`.
    pub fn add_event(&self, fd: RawFd, event: Event) -> IoResult<()> {
        let me = Fiber::current();
        fatal_assert!(
            !me.is_main(),
            "add_event fd={} event={}: no fiber to resume (called outside a fiber)",
            fd,
            event
        );
        self.reactor.add_event(&self.scheduler, fd, event, Payload::Fiber(me))
    }

    /// Run `f` as a scheduled task when `event` fires on `fd`
    pub fn add_event_callback<F>(&self, fd: RawFd, event: Event, f: F) -> IoResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.reactor
            .add_event(&self.scheduler, fd, event, Payload::Callback(Box::new(f)))
    }

    /// Forget a registration; its continuation never runs
    pub fn del_event(&self, fd: RawFd, event: Event) -> IoResult<()> {
        self.reactor.del_event(fd, event)
    }

    /// Forget a registration and run its continuation once now
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> IoResult<()> {
        self.reactor.cancel_event(fd, event)
    }

    /// Cancel every registration on `fd`
    pub fn cancel_all(&self, fd: RawFd) -> IoResult<()> {
        self.reactor.cancel_all(fd)
    }

    /// Registrations that have neither fired nor been removed
    pub fn pending_events(&self) -> usize {
        self.reactor.pending()
    }

    /// Descriptors the context table currently covers
    pub fn fd_capacity(&self) -> usize {
        self.reactor.fd_capacity()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl fmt::Display for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[IoManager pending={}] {}", self.pending_events(), self.scheduler)
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending", &self.pending_events())
            .finish()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        let on_own_worker = self.scheduler.caller_thread().is_none()
            && Scheduler::current().is_some_and(|s| Arc::ptr_eq(&s, &self.scheduler));
        if on_own_worker {
            // A worker cannot join itself
            let scheduler = Arc::clone(&self.scheduler);
            let reactor = Arc::clone(&self.reactor);
            kdebug!("io manager {} released on a worker; stopping from a helper", scheduler.name());
            let spawned = thread::Builder::new()
                .name(format!("{}_stop", scheduler.name()))
                .spawn(move || shutdown(&scheduler, &reactor));
            if let Err(e) = spawned {
                kerror!("io manager {}: cannot spawn shutdown thread: {}", self.scheduler.name(), e);
            }
            return;
        }
        shutdown(&self.scheduler, &self.reactor);
    }
}

/// Stop the workers and drop continuations nothing is left to fire
///
/// The poller, the pipe and the fd contexts go with the last reference
/// to the reactor, in that order.
fn shutdown(scheduler: &Scheduler, reactor: &Reactor) {
    scheduler.stop();
    let stranded = reactor.pending();
    if stranded > 0 {
        // Registered after an explicit stop; no worker will ever fire them
        kwarn!("io manager {}: dropping {} unfired continuations", scheduler.name(), stranded);
        reactor.clear();
    }
}
