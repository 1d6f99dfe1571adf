//! N:M fiber scheduler
//!
//! A `Scheduler` owns a FIFO of tasks (a fiber or a plain callback, each
//! with a thread affinity) and a pool of worker threads. Every worker runs
//! the same loop: claim the first task it is allowed to run, resume it,
//! route it by the state it comes back in, and fall back to its idle fiber
//! when nothing is claimable.
//!
//! With `include_caller_thread` the creating thread is one of the workers.
//! It has no thread of its own to run on, so its loop lives in a root fiber
//! that `stop()` resumes: the caller thread helps drain the queue while
//! stopping.
//!
//! What idle workers do, how they are woken and when the scheduler may
//! finish is delegated to [`SchedulerHooks`].

use crate::config::SchedulerConfig;
use crate::fiber::{Entry, Fiber, FiberRef};
use crate::hooks::{ParkingHooks, SchedulerHooks};
use crate::tls::{self, current_tid};
use crate::worker::WorkerPool;

use weft_core::{fatal, fatal_assert, kdebug, kerror, kinfo, kwarn};
use weft_core::{FiberError, FiberState, SchedError, SchedResult, ThreadAffinity, Tid};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;

/// A unit of scheduled work
pub enum Work {
    /// Resume this fiber
    Fiber(FiberRef),
    /// Run this closure on a (recycled) scheduler-owned fiber
    Callback(Entry),
}

impl Work {
    pub fn fiber(fiber: FiberRef) -> Self {
        Work::Fiber(fiber)
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Work::Callback(Box::new(f))
    }
}

impl From<FiberRef> for Work {
    fn from(fiber: FiberRef) -> Self {
        Work::Fiber(fiber)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Fiber(fiber) => write!(f, "Fiber({})", fiber.id()),
            Work::Callback(_) => write!(f, "Callback"),
        }
    }
}

/// Queue entry
#[derive(Debug)]
struct Task {
    work: Work,
    affinity: ThreadAffinity,
}

/// Fiber scheduler over a pool of OS threads
pub struct Scheduler {
    name: String,
    config: SchedulerConfig,
    hooks: Arc<dyn SchedulerHooks>,

    queue: Mutex<VecDeque<Task>>,
    workers: Mutex<WorkerPool>,

    /// Kernel ids of every thread running the loop, caller thread first
    thread_ids: RwLock<Vec<Tid>>,

    /// Threads `start()` spawns (excludes the caller thread)
    spawn_count: usize,

    /// Workers currently running a claimed task
    active: AtomicUsize,

    /// Workers currently inside their idle fiber
    idle: AtomicUsize,

    /// True until `start()`, and again once `stop()` begins
    stopping: AtomicBool,

    /// `stop()` was requested
    auto_stop: AtomicBool,

    /// Caller thread when `include_caller_thread`
    root_tid: Option<Tid>,

    /// Run loop of the caller thread
    root_fiber: Option<FiberRef>,

    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Scheduler with `worker_count` threads and default parking hooks
    ///
    /// Configuration comes from the environment; invalid values fall back
    /// to the build defaults. Aborts if `worker_count` is 0 or this thread
    /// already hosts a caller-thread scheduler.
    pub fn new(worker_count: usize, include_caller_thread: bool, name: &str) -> Arc<Self> {
        let config = SchedulerConfig::from_env();
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                kwarn!("{}; using built-in scheduler defaults", e);
                SchedulerConfig::new()
            }
        };
        match Self::with_config(worker_count, include_caller_thread, name, config) {
            Ok(scheduler) => scheduler,
            Err(e) => fatal!("cannot create scheduler {}: {}", name, e),
        }
    }

    /// Scheduler with explicit configuration and default parking hooks
    pub fn with_config(
        worker_count: usize,
        include_caller_thread: bool,
        name: &str,
        config: SchedulerConfig,
    ) -> SchedResult<Arc<Self>> {
        let hooks = Arc::new(ParkingHooks::new(config.park_timeout));
        Self::with_hooks(worker_count, include_caller_thread, name, config, hooks)
    }

    /// Scheduler whose idle behavior is supplied by `hooks`
    pub fn with_hooks(
        worker_count: usize,
        include_caller_thread: bool,
        name: &str,
        config: SchedulerConfig,
        hooks: Arc<dyn SchedulerHooks>,
    ) -> SchedResult<Arc<Self>> {
        config.validate()?;
        if worker_count == 0 {
            return Err(SchedError::InvalidConfig("worker_count must be > 0"));
        }

        let mut spawn_count = worker_count;
        let mut root_tid = None;
        if include_caller_thread {
            if tls::current_scheduler().is_some() {
                return Err(SchedError::WrongThread);
            }
            // Main fiber must exist before the root fiber can be resumed
            let _ = Fiber::current();
            spawn_count -= 1;
            root_tid = Some(current_tid());
        }

        let scheduler = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let root_fiber = root_tid
                .map(|_| Fiber::from_entry(root_entry(weak.clone()), config.stack_size));
            Scheduler {
                name: name.to_string(),
                config,
                hooks,
                queue: Mutex::new(VecDeque::new()),
                workers: Mutex::new(WorkerPool::new()),
                thread_ids: RwLock::new(root_tid.into_iter().collect()),
                spawn_count,
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_tid,
                root_fiber,
                weak_self: weak.clone(),
            }
        });

        if include_caller_thread {
            tls::register_scheduler(Arc::downgrade(&scheduler));
        }
        kdebug!("scheduler {} created ({} threads)", scheduler.name, worker_count);
        Ok(scheduler)
    }

    /// Scheduler driving the current thread, if any
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler()
    }

    fn is_current(&self) -> bool {
        Self::current().is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), self))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Idle, wake and stop behavior this scheduler was built with
    #[inline]
    pub fn hooks(&self) -> &Arc<dyn SchedulerHooks> {
        &self.hooks
    }

    /// Creating thread, when it is one of the workers
    #[inline]
    pub fn caller_thread(&self) -> Option<Tid> {
        self.root_tid
    }

    /// Threads running the loop, caller thread included
    pub fn worker_count(&self) -> usize {
        self.spawn_count + usize::from(self.root_tid.is_some())
    }

    /// Kernel ids of the threads running the loop (pinning targets)
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.thread_ids.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[inline]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, WorkerPool> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Queue work runnable on any worker
    pub fn schedule(&self, work: impl Into<Work>) {
        self.schedule_on(work, ThreadAffinity::Any);
    }

    /// Queue a closure runnable on any worker
    pub fn schedule_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Work::callback(f));
    }

    /// Queue work for the workers `affinity` admits
    pub fn schedule_on(&self, work: impl Into<Work>, affinity: impl Into<ThreadAffinity>) {
        let task = Task {
            work: work.into(),
            affinity: affinity.into(),
        };
        let pinned = task.affinity != ThreadAffinity::Any;
        let need_tickle = {
            let mut queue = self.lock_queue();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty || pinned
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue many entries under one lock acquisition
    pub fn schedule_batch<I, W>(&self, items: I)
    where
        I: IntoIterator<Item = W>,
        W: Into<Work>,
    {
        let need_tickle = {
            let mut queue = self.lock_queue();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(items.into_iter().map(|w| Task {
                work: w.into(),
                affinity: ThreadAffinity::Any,
            }));
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.tickle();
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the worker threads
    pub fn start(&self) -> SchedResult<()> {
        let mut workers = self.lock_workers();
        if !self.stopping.load(Ordering::SeqCst) {
            return Err(SchedError::AlreadyStarted);
        }
        self.stopping.store(false, Ordering::SeqCst);
        self.auto_stop.store(false, Ordering::SeqCst);

        // A finished root loop can run again after a restart
        if let Some(root) = &self.root_fiber {
            if root.state().is_terminal() {
                root.reset_entry(root_entry(self.weak_self.clone()));
            }
        }

        let me = self.weak_self.clone();
        let result = workers.start(self.spawn_count, &self.name, move || {
            if let Some(scheduler) = me.upgrade() {
                scheduler.run();
            }
        });

        if let Err(e) = result {
            // Unwind a partial start: the threads already running must see
            // a stopping scheduler and exit before start() can be retried
            kerror!("scheduler {} failed to start: {}", self.name, e);
            self.auto_stop.store(true, Ordering::SeqCst);
            self.stopping.store(true, Ordering::SeqCst);
            self.hooks.tickle_all(self);
            std::mem::take(&mut *workers).join();
            return Err(e);
        }

        *self.thread_ids.write().unwrap_or_else(PoisonError::into_inner) =
            self.root_tid.into_iter().chain(workers.tids()).collect();

        kinfo!("scheduler {} started ({} threads)", self.name, self.worker_count());
        Ok(())
    }

    /// Drain the queue, then stop and join every worker
    ///
    /// Blocks until all workers have exited. A caller-thread scheduler must
    /// be stopped from the thread that created it; no scheduler may be
    /// stopped from one of its own workers.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::SeqCst);

        if let Some(root) = &self.root_fiber {
            if self.spawn_count == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                self.stopping.store(true, Ordering::SeqCst);
                if self.stopping() {
                    kinfo!("scheduler {} stopped", self.name);
                    return;
                }
            }
        }

        match self.root_tid {
            Some(root) => fatal_assert!(
                current_tid() == root,
                "scheduler {} must be stopped from the thread that created it",
                self.name
            ),
            None => fatal_assert!(
                !self.is_current(),
                "scheduler {} stopped from one of its own workers",
                self.name
            ),
        }

        self.stopping.store(true, Ordering::SeqCst);
        self.hooks.tickle_all(self);

        if let Some(root) = &self.root_fiber {
            if !self.stopping() && root.state().is_resumable() {
                root.resume();
            }
        }

        let workers = std::mem::take(&mut *self.lock_workers());
        workers.join();
        *self.thread_ids.write().unwrap_or_else(PoisonError::into_inner) =
            self.root_tid.into_iter().collect();

        kinfo!("scheduler {} stopped", self.name);
    }

    /// Whether the run loops may exit
    pub fn stopping(&self) -> bool {
        self.hooks.stopping(self)
    }

    /// Stop requested, queue drained and no worker mid-task
    pub fn base_stopping(&self) -> bool {
        if !self.auto_stop.load(Ordering::SeqCst) || !self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        // Read both under the lock: a requeue happens before its worker
        // leaves the active count
        let queue = self.lock_queue();
        queue.is_empty() && self.active.load(Ordering::SeqCst) == 0
    }

    /// Wake an idle worker
    pub fn tickle(&self) {
        self.hooks.tickle(self);
    }

    /// Move the running fiber onto this scheduler (and thread)
    ///
    /// No-op if it already runs here on an admitted thread. Otherwise the
    /// fiber is queued here and yields; it continues on a worker of this
    /// scheduler.
    pub fn switch_to(&self, affinity: impl Into<ThreadAffinity>) {
        let affinity = affinity.into();
        if self.is_current() && affinity.admits(current_tid()) {
            return;
        }
        let me = Fiber::current();
        fatal_assert!(!me.is_main(), "switch_to called outside of a fiber");
        self.schedule_on(me, affinity);
        Fiber::yield_to_hold();
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    fn run(self: &Arc<Self>) {
        let _registration = tls::enter_scheduler(self);
        let tid = current_tid();
        let debug = self.config.debug_logging;
        kdebug!("scheduler {} run loop enter", self.name);

        let idle_fiber = {
            let me = Arc::downgrade(self);
            Fiber::from_entry(
                Box::new(move || {
                    if let Some(scheduler) = me.upgrade() {
                        scheduler.hooks.idle(&scheduler);
                    }
                }),
                self.config.stack_size,
            )
        };
        let mut callback_fiber: Option<FiberRef> = None;

        loop {
            let (task, tickle_me, skipped_busy) = self.take_task(tid);
            if tickle_me {
                self.tickle();
            }

            let Some(Task { work, affinity }) = task else {
                if skipped_busy {
                    // Claimable once it finishes switching out elsewhere
                    thread::yield_now();
                    continue;
                }
                if idle_fiber.state().is_terminal() {
                    break;
                }
                self.idle.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                self.idle.fetch_sub(1, Ordering::SeqCst);
                continue;
            };

            match work {
                Work::Fiber(fiber) => {
                    if debug {
                        kdebug!("resume fiber {}", fiber.id());
                    }
                    self.run_fiber(fiber, affinity);
                }
                Work::Callback(entry) => {
                    let fiber = match callback_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_entry(entry);
                            fiber
                        }
                        None => Fiber::from_entry(entry, self.config.stack_size),
                    };
                    if debug {
                        kdebug!("run callback on fiber {}", fiber.id());
                    }
                    // Route on the state this resume published; a reload
                    // could observe another worker's later resume
                    match fiber.resume() {
                        FiberState::Ready => self.requeue(fiber, affinity),
                        FiberState::Term | FiberState::Except => callback_fiber = Some(fiber),
                        // Held: whoever kept a handle resubmits it
                        _ => {}
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        kdebug!("scheduler {} run loop exit", self.name);
    }

    /// Claim the first task this thread may run
    ///
    /// Returns the task, whether another worker should be woken, and
    /// whether a runnable fiber was skipped only because it is still
    /// switching out on another thread.
    fn take_task(&self, tid: Tid) -> (Option<Task>, bool, bool) {
        let mut queue = self.lock_queue();
        let mut tickle_me = false;
        let mut skipped_busy = false;
        let mut found = None;

        let mut i = 0;
        while i < queue.len() {
            let task = &queue[i];
            if !task.affinity.admits(tid) {
                tickle_me = true;
                i += 1;
                continue;
            }
            if let Work::Fiber(fiber) = &task.work {
                if fiber.state() == FiberState::Exec {
                    skipped_busy = true;
                    i += 1;
                    continue;
                }
            }
            found = queue.remove(i);
            self.active.fetch_add(1, Ordering::SeqCst);
            break;
        }
        if found.is_some() && i < queue.len() {
            tickle_me = true;
        }
        (found, tickle_me, skipped_busy)
    }

    fn run_fiber(&self, fiber: FiberRef, affinity: ThreadAffinity) {
        match fiber.try_resume() {
            Ok(FiberState::Ready) => self.requeue(fiber, affinity),
            // Hold: dropped here. Term/Except: discarded.
            Ok(_) => {}
            Err(FiberError::AlreadyExecuting) => {
                // Queued twice and claimed by another worker in between
                self.requeue(fiber, affinity);
            }
            Err(e) => {
                kwarn!("discarding fiber {} ({}): {}", fiber.id(), fiber.state(), e);
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Put a task back without the empty-queue tickle heuristics
    fn requeue(&self, fiber: FiberRef, affinity: ThreadAffinity) {
        self.lock_queue().push_back(Task {
            work: Work::Fiber(fiber),
            affinity,
        });
    }
}

/// Body of the caller-thread root fiber
fn root_entry(scheduler: Weak<Scheduler>) -> Entry {
    Box::new(move || {
        if let Some(scheduler) = scheduler.upgrade() {
            scheduler.run();
        }
    })
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Scheduler name={} size={} active={} idle={} stopping={}]",
            self.name,
            self.worker_count(),
            self.active_count(),
            self.idle_count(),
            self.stopping.load(Ordering::SeqCst)
        )?;
        let ids = self.thread_ids();
        if !ids.is_empty() {
            write!(f, "\n    ")?;
            for (i, tid) in ids.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", tid)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count())
            .field("queued", &self.queued())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.stopping.load(Ordering::SeqCst) {
            kwarn!("scheduler {} dropped without stop()", self.name);
        }
    }
}

/// Runs the current fiber on another scheduler for the guard's lifetime
///
/// `new` moves the fiber onto `target`; dropping the guard moves it back
/// to the scheduler it was on. Only usable inside a scheduled fiber.
pub struct SchedulerSwitch {
    caller: Option<Arc<Scheduler>>,
}

impl SchedulerSwitch {
    pub fn new(target: Option<&Arc<Scheduler>>) -> Self {
        let caller = Scheduler::current();
        if let Some(target) = target {
            target.switch_to(ThreadAffinity::Any);
        }
        SchedulerSwitch { caller }
    }
}

impl Drop for SchedulerSwitch {
    fn drop(&mut self) {
        if let Some(caller) = self.caller.take() {
            caller.switch_to(ThreadAffinity::Any);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_aborts, is_victim};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn config() -> SchedulerConfig {
        SchedulerConfig::new().park_timeout(Duration::from_millis(20))
    }

    fn wait_for(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_five_callbacks_on_three_workers() {
        let sched = Scheduler::with_config(3, false, "five", config()).unwrap();
        sched.start().unwrap();

        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..5 {
            let c = count.clone();
            sched.schedule_fn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();

        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.queued(), 0);
    }

    #[test]
    fn test_drains_every_task_exactly_once() {
        let sched = Scheduler::with_config(4, true, "drain", config()).unwrap();
        sched.start().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..500u32 {
            let s = seen.clone();
            sched.schedule_fn(move || s.lock().unwrap().push(i));
        }
        sched.stop();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn test_caller_only_scheduler_runs_on_caller_thread() {
        let sched = Scheduler::with_config(1, true, "solo", config()).unwrap();
        assert!(Scheduler::current().is_some());
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        for _ in 0..3 {
            let tx = tx.clone();
            sched.schedule_fn(move || tx.send(current_tid()).unwrap());
        }
        // Nothing runs before stop() lends the caller thread
        assert_eq!(sched.queued(), 3);
        sched.stop();

        let me = current_tid();
        let tids: Vec<_> = rx.try_iter().collect();
        assert_eq!(tids, vec![me, me, me]);
    }

    #[test]
    fn test_pinned_tasks_stay_on_their_thread() {
        let sched = Scheduler::with_config(4, false, "pinned", config()).unwrap();
        sched.start().unwrap();
        let tids = sched.thread_ids();
        assert_eq!(tids.len(), 4);

        let observed = Arc::new(Mutex::new(Vec::new()));
        for round in 0..20 {
            for &tid in &tids {
                let o = observed.clone();
                sched.schedule_on(
                    Work::callback(move || o.lock().unwrap().push((tid, current_tid(), round))),
                    tid,
                );
            }
        }
        // Unpinned work mixed in
        for _ in 0..20 {
            sched.schedule_fn(|| {});
        }
        sched.stop();

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 80);
        for (pinned, ran_on, _) in observed.iter() {
            assert_eq!(pinned, ran_on);
        }
    }

    #[test]
    fn test_ready_fibers_are_requeued() {
        let sched = Scheduler::with_config(2, false, "ready", config()).unwrap();
        sched.start().unwrap();

        let steps = Arc::new(AtomicU32::new(0));
        let fibers: Vec<_> = (0..4)
            .map(|_| {
                let s = steps.clone();
                Fiber::new(move || {
                    for _ in 0..3 {
                        s.fetch_add(1, Ordering::SeqCst);
                        Fiber::yield_to_ready();
                    }
                })
            })
            .collect();
        sched.schedule_batch(fibers.iter().cloned());
        sched.stop();

        assert_eq!(steps.load(Ordering::SeqCst), 12);
        assert!(fibers.iter().all(|f| f.state() == FiberState::Term));
    }

    #[test]
    fn test_held_fiber_runs_again_when_rescheduled() {
        let sched = Scheduler::with_config(2, false, "hold", config()).unwrap();
        sched.start().unwrap();

        let stage = Arc::new(AtomicU32::new(0));
        let s = stage.clone();
        let fiber = Fiber::new(move || {
            s.store(1, Ordering::SeqCst);
            Fiber::yield_to_hold();
            s.store(2, Ordering::SeqCst);
        });
        sched.schedule(fiber.clone());
        wait_for("fiber to hold", || fiber.state() == FiberState::Hold);
        assert_eq!(stage.load(Ordering::SeqCst), 1);

        sched.schedule(fiber.clone());
        sched.stop();
        assert_eq!(stage.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_self_rescheduled_fiber_resumes_once_per_yield() {
        const FIBERS: usize = 64;
        const ROUNDS: usize = 100;

        let sched = Scheduler::with_config(4, false, "self-resched", config()).unwrap();
        sched.start().unwrap();

        let resumes = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let overrun = Arc::new(AtomicUsize::new(0));
        let fibers: Vec<_> = (0..FIBERS)
            .map(|_| {
                let (resumes, finished, overrun) =
                    (resumes.clone(), finished.clone(), overrun.clone());
                Fiber::new(move || {
                    let me = Scheduler::current().unwrap();
                    for _ in 0..ROUNDS {
                        // Queued while still running; claimed once it holds
                        me.schedule(Fiber::current());
                        Fiber::yield_to_hold();
                        resumes.fetch_add(1, Ordering::SeqCst);
                        Fiber::yield_to_ready();
                        resumes.fetch_add(1, Ordering::SeqCst);
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                    // Nobody reschedules this hold
                    Fiber::yield_to_hold();
                    overrun.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sched.schedule_batch(fibers.iter().cloned());

        wait_for("all fibers to finish", || {
            finished.load(Ordering::SeqCst) == FIBERS
        });
        sched.stop();

        assert_eq!(resumes.load(Ordering::SeqCst), FIBERS * ROUNDS * 2);
        assert_eq!(overrun.load(Ordering::SeqCst), 0);
        assert_eq!(sched.queued(), 0);
        assert!(fibers.iter().all(|f| f.state() == FiberState::Hold));
    }

    #[test]
    fn test_panicking_task_does_not_stop_scheduler() {
        let sched = Scheduler::with_config(2, false, "panics", config()).unwrap();
        sched.start().unwrap();

        let count = Arc::new(AtomicU32::new(0));
        sched.schedule_fn(|| panic!("task failure"));
        for _ in 0..10 {
            let c = count.clone();
            sched.schedule_fn(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        let failing = Fiber::new(|| panic!("fiber failure"));
        sched.schedule(failing.clone());
        sched.stop();

        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(failing.state(), FiberState::Except);
    }

    #[test]
    fn test_current_scheduler_inside_task() {
        let sched = Scheduler::with_config(2, false, "current", config()).unwrap();
        sched.start().unwrap();

        let (tx, rx) = mpsc::channel();
        sched.schedule_fn(move || {
            let name = Scheduler::current().map(|s| s.name().to_string());
            tx.send(name).unwrap();
        });
        sched.stop();

        assert_eq!(rx.recv().unwrap().as_deref(), Some("current"));
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_switch_to_moves_fiber_to_thread() {
        let sched = Scheduler::with_config(3, false, "switch", config()).unwrap();
        sched.start().unwrap();
        let target = sched.thread_ids()[2];

        let (tx, rx) = mpsc::channel();
        let s = sched.clone();
        sched.schedule_fn(move || {
            s.switch_to(target);
            tx.send(current_tid()).unwrap();
        });
        let landed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        sched.stop();
        assert_eq!(landed, target);
    }

    #[test]
    fn test_scheduler_switch_guard() {
        let a = Scheduler::with_config(1, false, "alpha", config()).unwrap();
        let b = Scheduler::with_config(1, false, "beta", config()).unwrap();
        a.start().unwrap();
        b.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let target = b.clone();
        a.schedule_fn(move || {
            let current = || Scheduler::current().map(|s| s.name().to_string());
            let mut names = vec![current()];
            {
                let _switch = SchedulerSwitch::new(Some(&target));
                names.push(current());
            }
            names.push(current());
            tx.send(names).unwrap();
        });

        let names = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        a.stop();
        b.stop();

        let names: Vec<_> = names.into_iter().map(|n| n.unwrap()).collect();
        assert_eq!(names, vec!["alpha", "beta", "alpha"]);
    }

    #[test]
    fn test_spread_over_workers() {
        let sched = Scheduler::with_config(3, false, "spread", config()).unwrap();
        sched.start().unwrap();

        let per_thread = Arc::new(Mutex::new(HashMap::<Tid, u32>::new()));
        let items: Vec<Work> = (0..300)
            .map(|_| {
                let p = per_thread.clone();
                Work::callback(move || {
                    *p.lock().unwrap().entry(current_tid()).or_default() += 1;
                })
            })
            .collect();
        sched.schedule_batch(items);
        sched.stop();

        let per_thread = per_thread.lock().unwrap();
        assert_eq!(per_thread.values().sum::<u32>(), 300);
        assert!(per_thread.keys().all(|t| *t != current_tid()));
    }

    #[test]
    fn test_lifecycle_errors_and_display() {
        assert_eq!(
            Scheduler::with_config(0, false, "none", config()).err(),
            Some(SchedError::InvalidConfig("worker_count must be > 0"))
        );

        let sched = Scheduler::with_config(2, false, "life", config()).unwrap();
        // Stop before start is a no-op
        sched.stop();

        sched.start().unwrap();
        assert_eq!(sched.start(), Err(SchedError::AlreadyStarted));
        let dump = sched.to_string();
        assert!(dump.starts_with("[Scheduler name=life size=2"));
        assert_eq!(sched.thread_ids().len(), 2);
        sched.stop();
        assert!(sched.thread_ids().is_empty());
        assert!(sched.stopping());

        // Restart after stop
        let count = Arc::new(AtomicU32::new(0));
        sched.start().unwrap();
        let c = count.clone();
        sched.schedule_fn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_start_unwinds_and_can_retry() {
        let sched = Scheduler::with_config(3, false, "partial", config()).unwrap();
        sched.lock_workers().limit_spawns(1);

        assert!(matches!(sched.start(), Err(SchedError::Spawn(_))));
        // The one thread that did start has been joined
        assert!(sched.lock_workers().is_empty());
        assert!(sched.thread_ids().is_empty());
        assert!(sched.stopping());

        sched.lock_workers().limit_spawns(3);
        sched.start().unwrap();
        assert_eq!(sched.thread_ids().len(), 3);
        let (tx, rx) = mpsc::channel();
        sched.schedule_fn(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        sched.stop();
    }

    #[test]
    fn test_hooks_downcast_and_caller_thread() {
        let sched = Scheduler::with_config(1, false, "hooks", config()).unwrap();
        let hooks: &dyn std::any::Any = &**sched.hooks();
        assert!(hooks.downcast_ref::<ParkingHooks>().is_some());
        assert_eq!(sched.caller_thread(), None);

        thread::spawn(|| {
            let sched = Scheduler::with_config(1, true, "hooks_caller", config()).unwrap();
            assert_eq!(sched.caller_thread(), Some(current_tid()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_stop_wakes_every_parked_worker() {
        let slow = SchedulerConfig::new().park_timeout(Duration::from_secs(30));
        let sched = Scheduler::with_config(4, false, "wake_all", slow).unwrap();
        sched.start().unwrap();
        wait_for("all workers idle", || sched.idle_count() == 4);

        let start = Instant::now();
        sched.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(sched.thread_ids().is_empty());
    }

    #[test]
    fn test_second_caller_scheduler_on_thread_rejected() {
        thread::spawn(|| {
            let first = Scheduler::with_config(1, true, "first", config()).unwrap();
            let second = Scheduler::with_config(1, true, "second", config());
            assert_eq!(second.err(), Some(SchedError::WrongThread));
            first.start().unwrap();
            first.stop();
            drop(first);
            // Registration lapses with the scheduler
            assert!(Scheduler::with_config(1, true, "third", config()).is_ok());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_stop_from_own_worker_aborts() {
        if is_victim() {
            let sched = Scheduler::with_config(1, false, "selfstop", config()).unwrap();
            sched.start().unwrap();
            let s = sched.clone();
            sched.schedule_fn(move || s.stop());
            thread::sleep(Duration::from_secs(10));
            return;
        }
        assert_aborts("scheduler::tests::test_stop_from_own_worker_aborts");
    }
}
