//! Architecture-specific execution contexts
//!
//! Every backend exposes the same surface:
//!
//! - `Context` - saved callee-saved register set, `#[repr(C)]` for the asm
//! - `Context::new()` - empty context; filled in by the first `switch` out of it
//! - `Context::prepare(stack_top, entry, arg)` - make the context start at `entry(arg)`
//! - `switch(from, to)` - save the running registers into `from`, load `to`
//!
//! Fiber and scheduler code only ever sees these four operations.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{Context, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{Context, switch};
    }
}

/// Entry point a prepared context starts in. Receives the `arg` given to
/// `Context::prepare` and must never return.
pub type EntryFn = extern "C" fn(usize) -> !;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Stack;
    use std::cell::UnsafeCell;

    struct PingPong {
        main: UnsafeCell<Context>,
        other: UnsafeCell<Context>,
        hits: UnsafeCell<Vec<u32>>,
    }

    extern "C" fn bounce(arg: usize) -> ! {
        let pp = unsafe { &*(arg as *const PingPong) };
        for i in 0..3u32 {
            unsafe {
                (*pp.hits.get()).push(i);
                switch(pp.other.get(), pp.main.get());
            }
        }
        unreachable!("bounce resumed after its last switch");
    }

    #[test]
    fn test_switch_round_trips() {
        let stack = Stack::new(64 * 1024).unwrap();
        let pp = Box::new(PingPong {
            main: UnsafeCell::new(Context::new()),
            other: UnsafeCell::new(Context::new()),
            hits: UnsafeCell::new(Vec::new()),
        });
        unsafe {
            (*pp.other.get()).prepare(stack.top(), bounce, &*pp as *const PingPong as usize);
            for expected in 1..=3 {
                switch(pp.main.get(), pp.other.get());
                assert_eq!((*pp.hits.get()).len(), expected);
            }
            assert_eq!(*pp.hits.get(), vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_float_math_on_fiber_stack() {
        // SSE/NEON code needs a correctly aligned stack at call boundaries
        struct Job {
            main: UnsafeCell<Context>,
            other: UnsafeCell<Context>,
            out: UnsafeCell<f64>,
        }
        extern "C" fn compute(arg: usize) -> ! {
            let job = unsafe { &*(arg as *const Job) };
            let v: Vec<f64> = (1..=100).map(|x| (x as f64).sqrt()).collect();
            unsafe {
                *job.out.get() = v.iter().sum();
                switch(job.other.get(), job.main.get());
            }
            unreachable!();
        }

        let stack = Stack::new(64 * 1024).unwrap();
        let job = Box::new(Job {
            main: UnsafeCell::new(Context::new()),
            other: UnsafeCell::new(Context::new()),
            out: UnsafeCell::new(0.0),
        });
        unsafe {
            (*job.other.get()).prepare(stack.top(), compute, &*job as *const Job as usize);
            switch(job.main.get(), job.other.get());
            let expected: f64 = (1..=100).map(|x| (x as f64).sqrt()).sum();
            assert!((*job.out.get() - expected).abs() < 1e-9);
        }
    }
}
