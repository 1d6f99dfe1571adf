//! Thread-local registry
//!
//! Per OS thread: the running fiber, the thread's main fiber, the
//! scheduler driving the thread and a cached OS thread id.
//!
//! A fiber can suspend on one thread and resume on another. The compiler
//! may keep a thread-local address in a register across a call that
//! switches stacks, so every accessor here is `#[inline(never)]` and
//! recomputes the address on each call.

use crate::fiber::{Fiber, FiberRef};
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};
use weft_core::Tid;

thread_local! {
    /// Fiber currently executing on this thread (borrowed, not owned)
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(std::ptr::null()) };

    /// Owning handle of this thread's main fiber
    static MAIN_FIBER: RefCell<Option<FiberRef>> = const { RefCell::new(None) };

    /// Scheduler whose run loop (or caller-thread registration) owns this thread
    static SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// Cached OS thread id, 0 until first asked
    static TID: Cell<i32> = const { Cell::new(0) };
}

/// Raw pointer to the running fiber, null before the main fiber exists
#[inline(never)]
pub(crate) fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

#[inline(never)]
pub(crate) fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(fiber));
}

/// Install `main` as this thread's main fiber and make it current
#[inline(never)]
pub(crate) fn install_main_fiber(main: FiberRef) {
    set_current_fiber(Arc::as_ptr(&main));
    MAIN_FIBER.with(|slot| *slot.borrow_mut() = Some(main));
}

/// Clear the current-fiber pointer if it still points at `fiber`
///
/// Runs from main fiber teardown, possibly during thread-local destruction.
#[inline(never)]
pub(crate) fn forget_fiber(fiber: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|cell| {
        if cell.get() == fiber {
            cell.set(std::ptr::null());
        }
    });
}

/// Scheduler registered for this thread, if it is still alive
#[inline(never)]
pub(crate) fn current_scheduler() -> Option<Arc<Scheduler>> {
    SCHEDULER
        .try_with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
        .ok()
        .flatten()
}

/// Register `scheduler` for this thread until the guard drops
#[inline(never)]
pub(crate) fn enter_scheduler(scheduler: &Arc<Scheduler>) -> SchedulerGuard {
    let previous = SCHEDULER.with(|slot| slot.replace(Some(Arc::downgrade(scheduler))));
    SchedulerGuard { previous }
}

/// Register `scheduler` for this thread with no scoped end
///
/// Used for the caller thread of an `include_caller_thread` scheduler; the
/// registration lapses on its own once the scheduler is dropped.
#[inline(never)]
pub(crate) fn register_scheduler(scheduler: Weak<Scheduler>) {
    SCHEDULER.with(|slot| *slot.borrow_mut() = Some(scheduler));
}

/// Restores the previous scheduler registration on drop
pub(crate) struct SchedulerGuard {
    previous: Option<Weak<Scheduler>>,
}

impl Drop for SchedulerGuard {
    #[inline(never)]
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = SCHEDULER.try_with(|slot| *slot.borrow_mut() = previous);
    }
}

/// OS thread id of the calling thread
#[inline(never)]
pub fn current_tid() -> Tid {
    TID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return Tid::new(cached);
        }
        let tid = os_tid();
        cell.set(tid);
        Tid::new(tid)
    })
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn os_tid() -> i32 {
            unsafe { libc::syscall(libc::SYS_gettid) as i32 }
        }
    } else {
        // No gettid: hand out process-unique ids instead
        fn os_tid() -> i32 {
            use std::sync::atomic::{AtomicI32, Ordering};
            static NEXT: AtomicI32 = AtomicI32::new(1);
            NEXT.fetch_add(1, Ordering::Relaxed)
        }
    }
}
