//! Stackful fibers
//!
//! A `Fiber` owns a guarded stack, an entry closure and a saved execution
//! context. `resume` switches from whatever runs on this thread into the
//! fiber; the fiber gives control back with one of the `yield_*` functions
//! or by finishing its entry.
//!
//! # State ownership
//!
//! While a fiber runs it is `Exec` and only the thread running it touches
//! its context and entry. A yielding fiber never writes its own state: it
//! records the state it wants (`Ready`, `Hold`) and the resumer stores it
//! after the switch has completed. Another worker that sees a non-`Exec`
//! state can therefore resume the fiber immediately, the old stack frame
//! is guaranteed to be abandoned.
//!
//! # Main fibers
//!
//! Every thread that touches fibers gets a main fiber on first use. It has
//! no stack of its own and stands for the thread's original stack; it is
//! the resumer of the first fiber the thread runs.

use crate::arch::{self, Context};
use crate::config::default_stack_size;
use crate::memory::Stack;
use crate::tls;
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use weft_core::{fatal, kerror, kprint, kwarn, FiberError, FiberId, FiberOutcome, FiberState};

/// Shared handle to a fiber
pub type FiberRef = Arc<Fiber>;

/// Boxed fiber body
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Next stackful fiber id; main fibers all use 0
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Live fibers, main fibers included
static TOTAL: AtomicUsize = AtomicUsize::new(0);

/// `requested` value meaning "nothing asked for"
const NO_REQUEST: u8 = u8::MAX;

/// A stackful coroutine
pub struct Fiber {
    id: FiberId,

    /// `FiberState` as u8
    state: AtomicU8,

    /// State the fiber asked for on its way out, applied by the resumer
    requested: AtomicU8,

    /// Saved registers while not running
    ctx: UnsafeCell<Context>,

    /// Context to switch back to on yield; set by every resume
    resumer: AtomicPtr<Context>,

    /// None for a thread main fiber
    stack: Option<Stack>,

    /// Body not yet started
    entry: UnsafeCell<Option<Entry>>,

    outcome: Mutex<Option<FiberOutcome>>,
}

// Safety: `ctx` and `entry` are only touched by whoever moved the state to
// Exec (resume, reset) or by the fiber itself while Exec. The CAS into Exec
// makes that access exclusive.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size
    pub fn new<F>(f: F) -> FiberRef
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_stack_size(f, 0)
    }

    /// Create a fiber; `stack_size == 0` means the configured default
    ///
    /// Aborts if the stack cannot be mapped.
    pub fn with_stack_size<F>(f: F, stack_size: usize) -> FiberRef
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_entry(Box::new(f), stack_size)
    }

    /// Create a fiber, reporting stack allocation failure
    pub fn try_new<F>(f: F, stack_size: usize) -> Result<FiberRef, FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::try_from_entry(Box::new(f), stack_size)
    }

    pub(crate) fn from_entry(entry: Entry, stack_size: usize) -> FiberRef {
        match Self::try_from_entry(entry, stack_size) {
            Ok(fiber) => fiber,
            Err(e) => fatal!("cannot create fiber: {}", e),
        }
    }

    fn try_from_entry(entry: Entry, stack_size: usize) -> Result<FiberRef, FiberError> {
        let size = if stack_size == 0 { default_stack_size() } else { stack_size };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Init as u8),
            requested: AtomicU8::new(NO_REQUEST),
            ctx: UnsafeCell::new(Context::new()),
            resumer: AtomicPtr::new(std::ptr::null_mut()),
            stack: Some(stack),
            entry: UnsafeCell::new(Some(entry)),
            outcome: Mutex::new(None),
        });
        TOTAL.fetch_add(1, Ordering::Relaxed);
        fiber.prepare_context();
        Ok(fiber)
    }

    fn new_main() -> Fiber {
        TOTAL.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: FiberId::MAIN,
            state: AtomicU8::new(FiberState::Exec as u8),
            requested: AtomicU8::new(NO_REQUEST),
            ctx: UnsafeCell::new(Context::new()),
            resumer: AtomicPtr::new(std::ptr::null_mut()),
            stack: None,
            entry: UnsafeCell::new(None),
            outcome: Mutex::new(None),
        }
    }

    /// Point the context at `fiber_entry` on a fresh stack frame
    fn prepare_context(&self) {
        let Some(stack) = &self.stack else { return };
        // Safety: state is Init or held at Exec by reset; nobody else
        // touches ctx. The Fiber lives in an Arc so `self` is stable.
        unsafe {
            (*self.ctx.get()).prepare(stack.top(), fiber_entry, self as *const Fiber as usize);
        }
    }

    // ------------------------------------------------------------------
    // Thread-local identity
    // ------------------------------------------------------------------

    /// The fiber running on this thread, creating the main fiber if needed
    pub fn current() -> FiberRef {
        let ptr = current_ptr();
        // Safety: the running fiber is kept alive by its resumer (or by the
        // thread-local main fiber slot) for as long as it runs.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Id of the running fiber; 0 on a thread that never used fibers
    pub fn current_id() -> FiberId {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            FiberId::MAIN
        } else {
            // Safety: see `current`
            unsafe { (*ptr).id }
        }
    }

    /// Live fibers in the process, main fibers included
    pub fn total() -> usize {
        TOTAL.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Usable stack bytes, 0 for a main fiber
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// Lowest usable stack address; identifies the stack mapping
    pub fn stack_base(&self) -> Option<*const u8> {
        self.stack.as_ref().map(|s| s.bottom() as *const u8)
    }

    /// How the body ended, None until the fiber is Term or Except
    pub fn outcome(&self) -> Option<FiberOutcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ------------------------------------------------------------------
    // Resume / reset
    // ------------------------------------------------------------------

    /// Switch into this fiber until it yields or finishes
    ///
    /// Returns the state the fiber left in. Aborts the process on misuse:
    /// resuming a running, finished or main fiber.
    pub fn resume(&self) -> FiberState {
        match self.try_resume() {
            Ok(state) => state,
            Err(e) => fatal!("cannot resume fiber {} ({}): {}", self.id, self.state(), e),
        }
    }

    /// Checked form of [`resume`](Self::resume)
    ///
    /// Returns the state published after the switch back: Hold, Ready,
    /// Term or Except. Once published, another thread may claim the fiber,
    /// so callers route on this value rather than reloading `state()`.
    pub fn try_resume(&self) -> Result<FiberState, FiberError> {
        if self.is_main() {
            return Err(FiberError::MainFiber);
        }
        self.claim()?;

        let caller_ptr = current_ptr();
        // Safety: the caller is the running fiber of this thread
        let caller = unsafe { &*caller_ptr };

        self.requested.store(NO_REQUEST, Ordering::Relaxed);
        self.resumer.store(caller.ctx.get(), Ordering::Release);
        tls::set_current_fiber(self);
        kprint::set_fiber_id(self.id.as_u64());

        // Safety: we own the Exec claim; the stack outlives the switch
        unsafe { arch::switch(caller.ctx.get(), self.ctx.get()) };

        // Back on the caller's stack, same thread
        tls::set_current_fiber(caller_ptr);
        kprint::set_fiber_id(caller.id.as_u64());

        let next = match self.requested.swap(NO_REQUEST, Ordering::Acquire) {
            NO_REQUEST => FiberState::Hold,
            s => FiberState::from(s),
        };
        self.state.store(next as u8, Ordering::Release);
        Ok(next)
    }

    /// Move Init/Hold/Ready to Exec, exactly once per resume
    fn claim(&self) -> Result<(), FiberError> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let state = FiberState::from(cur);
            if state == FiberState::Exec {
                return Err(FiberError::AlreadyExecuting);
            }
            if state.is_terminal() {
                return Err(FiberError::Terminated);
            }
            match self.state.compare_exchange_weak(
                cur,
                FiberState::Exec as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Reuse the stack for a new body; state becomes Init
    ///
    /// Aborts unless the fiber is Init, Term or Except.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_entry(Box::new(f));
    }

    /// Checked form of [`reset`](Self::reset)
    pub fn try_reset<F>(&self, f: F) -> Result<(), FiberError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_reset_entry(Box::new(f))
    }

    pub(crate) fn reset_entry(&self, entry: Entry) {
        if let Err(e) = self.try_reset_entry(entry) {
            fatal!("cannot reset fiber {} ({}): {}", self.id, self.state(), e);
        }
    }

    fn try_reset_entry(&self, entry: Entry) -> Result<(), FiberError> {
        if self.is_main() {
            return Err(FiberError::MainFiber);
        }
        let cur = self.state.load(Ordering::Acquire);
        if !FiberState::from(cur).is_resettable() {
            return Err(FiberError::NotResettable);
        }
        // Park the state at Exec while rewriting so nobody resumes a half-reset fiber
        self.state
            .compare_exchange(cur, FiberState::Exec as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| FiberError::NotResettable)?;

        // Safety: exclusive through the Exec claim above
        unsafe { *self.entry.get() = Some(entry) };
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.prepare_context();

        self.state.store(FiberState::Init as u8, Ordering::Release);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Yield
    // ------------------------------------------------------------------

    /// Give control back to the resumer; the fiber ends up Hold
    pub fn yield_now() {
        yield_with(None);
    }

    /// Yield and ask to be re-queued (Ready)
    pub fn yield_to_ready() {
        yield_with(Some(FiberState::Ready));
    }

    /// Yield and park (Hold) until someone schedules this fiber again
    pub fn yield_to_hold() {
        yield_with(Some(FiberState::Hold));
    }

    /// Run the body, record how it ended
    fn run_entry(&self) {
        // Safety: we are the running fiber
        let entry = unsafe { (*self.entry.get()).take() };
        let outcome = match entry {
            Some(f) => match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => FiberOutcome::Completed,
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    kerror!("fiber {} panicked: {}", self.id, msg);
                    FiberOutcome::Panicked(msg)
                }
            },
            None => FiberOutcome::Completed,
        };
        self.requested.store(outcome.terminal_state() as u8, Ordering::Release);
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    }
}

/// Running fiber of this thread, installing a main fiber on first use
fn current_ptr() -> *const Fiber {
    let ptr = tls::current_fiber_ptr();
    if !ptr.is_null() {
        return ptr;
    }
    let main = Arc::new(Fiber::new_main());
    let ptr = Arc::as_ptr(&main);
    tls::install_main_fiber(main);
    ptr
}

#[inline(never)]
fn yield_with(request: Option<FiberState>) {
    let ptr = tls::current_fiber_ptr();
    if ptr.is_null() {
        fatal!("yield outside of a fiber");
    }
    // Safety: the running fiber is alive while it runs
    let fiber = unsafe { &*ptr };
    if fiber.is_main() {
        fatal!("a thread main fiber cannot yield");
    }
    if fiber.state() != FiberState::Exec {
        fatal!("fiber {} yielding while {}", fiber.id, fiber.state());
    }

    if let Some(state) = request {
        fiber.requested.store(state as u8, Ordering::Release);
    }
    let resumer = fiber.resumer.load(Ordering::Acquire);
    // Safety: the resumer is blocked inside `try_resume` on this thread
    unsafe { arch::switch(fiber.ctx.get(), resumer) };
}

/// First frame on every fiber stack
extern "C" fn fiber_entry(arg: usize) -> ! {
    // Safety: `arg` is the Fiber that prepared this context. Its resumer
    // holds a handle, so it is alive for as long as it runs.
    let fiber = unsafe { &*(arg as *const Fiber) };
    fiber.run_entry();

    // Nothing owned may remain on this frame: the stack can be freed or
    // reset as soon as the switch below lands.
    let resumer = fiber.resumer.load(Ordering::Acquire);
    unsafe { arch::switch(fiber.ctx.get(), resumer) };
    fatal!("fiber {} resumed after it finished", fiber.id)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL.fetch_sub(1, Ordering::Relaxed);

        if self.is_main() {
            tls::forget_fiber(self);
            return;
        }
        match self.state() {
            FiberState::Exec => fatal!("fiber {} dropped while executing", self.id),
            FiberState::Hold | FiberState::Ready => {
                // Frames on the stack are never unwound; their destructors don't run
                kwarn!("fiber {} dropped while suspended ({})", self.id, self.state());
            }
            _ => {}
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_aborts, is_victim};
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_resume_yield_finish() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let fiber = Fiber::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_now();
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fiber.state(), FiberState::Init);
        fiber.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Hold);
        assert!(fiber.outcome().is_none());

        fiber.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(fiber.outcome(), Some(FiberOutcome::Completed));
    }

    #[test]
    fn test_yield_to_ready_and_hold() {
        let fiber = Fiber::new(|| {
            Fiber::yield_to_ready();
            Fiber::yield_to_hold();
        });
        assert_eq!(fiber.resume(), FiberState::Ready);
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.try_resume(), Ok(FiberState::Hold));
        assert_eq!(fiber.state(), FiberState::Hold);
        assert_eq!(fiber.resume(), FiberState::Term);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_panic_becomes_except() {
        let fiber = Fiber::new(|| panic!("boom"));
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Except);
        assert_eq!(fiber.outcome(), Some(FiberOutcome::Panicked("boom".into())));
        assert_eq!(fiber.try_resume(), Err(FiberError::Terminated));
    }

    #[test]
    fn test_reset_reuses_stack() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(move || l.lock().unwrap().push("first"));
        let base = fiber.stack_base();

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let l = log.clone();
        fiber.reset(move || {
            l.lock().unwrap().push("second");
            Fiber::yield_now();
            l.lock().unwrap().push("third");
        });
        assert_eq!(fiber.state(), FiberState::Init);
        assert!(fiber.outcome().is_none());
        assert_eq!(fiber.stack_base(), base);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Hold);
        fiber.resume();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(fiber.stack_base(), base);
    }

    #[test]
    fn test_reset_rejected_while_suspended() {
        let fiber = Fiber::new(Fiber::yield_now);
        fiber.resume();
        assert_eq!(fiber.try_reset(|| {}), Err(FiberError::NotResettable));
        fiber.resume();
        assert!(fiber.try_reset(|| {}).is_ok());
    }

    #[test]
    fn test_main_fiber() {
        thread::spawn(|| {
            assert_eq!(Fiber::current_id(), FiberId::MAIN);
            let main = Fiber::current();
            assert!(main.is_main());
            assert_eq!(main.state(), FiberState::Exec);
            assert_eq!(main.stack_size(), 0);
            assert_eq!(main.try_resume(), Err(FiberError::MainFiber));
            assert_eq!(main.try_reset(|| {}), Err(FiberError::MainFiber));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_current_inside_fiber() {
        let (tx, rx) = mpsc::channel();
        let fiber = Fiber::new(move || {
            let me = Fiber::current();
            tx.send((me.id(), Fiber::current_id(), me.state())).unwrap();
        });
        let id = fiber.id();
        fiber.resume();

        let (seen, current_id, state) = rx.recv().unwrap();
        assert_eq!(seen, id);
        assert_eq!(current_id, id);
        assert_eq!(state, FiberState::Exec);
        assert!(Fiber::current().is_main());
    }

    #[test]
    fn test_nested_resume() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let outer = Fiber::new(move || {
            let o2 = o.clone();
            let inner = Fiber::new(move || {
                o2.lock().unwrap().push("inner");
                Fiber::yield_now();
                o2.lock().unwrap().push("inner again");
            });
            o.lock().unwrap().push("outer");
            inner.resume();
            o.lock().unwrap().push("outer after inner yield");
            Fiber::yield_now();
            inner.resume();
            assert_eq!(inner.state(), FiberState::Term);
        });

        outer.resume();
        assert_eq!(outer.state(), FiberState::Hold);
        outer.resume();
        assert_eq!(outer.state(), FiberState::Term);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer", "inner", "outer after inner yield", "inner again"]
        );
    }

    #[test]
    fn test_fiber_migrates_between_threads() {
        let (tx, rx) = mpsc::channel();
        let fiber = Fiber::new(move || {
            tx.send(tls::current_tid()).unwrap();
            Fiber::yield_now();
            tx.send(tls::current_tid()).unwrap();
        });

        let f = fiber.clone();
        let first = thread::spawn(move || {
            f.resume();
            tls::current_tid()
        })
        .join()
        .unwrap();
        let f = fiber.clone();
        let second = thread::spawn(move || {
            f.resume();
            tls::current_tid()
        })
        .join()
        .unwrap();

        assert_eq!(rx.recv().unwrap(), first);
        assert_eq!(rx.recv().unwrap(), second);
        assert_ne!(first, second);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Fiber::new(|| {});
        let b = Fiber::new(|| {});
        assert_ne!(a.id(), b.id());
        assert!(!a.id().is_main());
        assert!(Fiber::total() >= 2);
    }

    #[test]
    fn test_concurrent_resume_is_rejected() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let fiber = Fiber::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        let f = fiber.clone();
        let runner = thread::spawn(move || f.resume());
        started_rx.recv().unwrap();

        assert_eq!(fiber.state(), FiberState::Exec);
        assert_eq!(fiber.try_resume(), Err(FiberError::AlreadyExecuting));

        release_tx.send(()).unwrap();
        runner.join().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_double_resume_aborts() {
        if is_victim() {
            let (started_tx, started_rx) = mpsc::channel();
            let fiber = Fiber::new(move || {
                started_tx.send(()).unwrap();
                loop {
                    thread::park();
                }
            });
            let f = fiber.clone();
            thread::spawn(move || f.resume());
            started_rx.recv().unwrap();
            fiber.resume();
            return;
        }
        assert_aborts("fiber::tests::test_double_resume_aborts");
    }

    #[test]
    fn test_resume_after_term_aborts() {
        if is_victim() {
            let fiber = Fiber::new(|| {});
            fiber.resume();
            fiber.resume();
            return;
        }
        assert_aborts("fiber::tests::test_resume_after_term_aborts");
    }
}
