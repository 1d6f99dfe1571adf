//! Basic weft example
//!
//! Runs callbacks and yielding fibers on a three-worker scheduler that
//! also uses the calling thread, pins a task to one worker and moves a
//! running fiber between threads with `switch_to`.
//!
//! # Environment Variables
//!
//! - `WEFT_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `WEFT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use weft::{current_tid, kdebug, kinfo, Fiber, Scheduler, SchedulerConfig, ThreadAffinity};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// WEFT_LOG_LEVEL=debug WEFT_FLUSH_EPRINT=1 cargo run -p weft-basic
fn main() {
    println!("=== weft Basic Example ===\n");

    let config = SchedulerConfig::from_env().debug_logging(true);
    println!("config: {}", config);

    let sched = match Scheduler::with_config(3, true, "basic", config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot create scheduler: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = sched.start() {
        eprintln!("cannot start scheduler: {}", e);
        std::process::exit(1);
    }

    let completed = Arc::new(AtomicUsize::new(0));

    kinfo!("Scheduling callbacks...");
    for i in 1..=5 {
        let c = completed.clone();
        sched.schedule_fn(move || {
            kdebug!("[callback {}] on tid {}", i, current_tid());
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Fibers that give up the CPU between iterations
    for i in 1..=3 {
        let c = completed.clone();
        let fiber = Fiber::new(move || {
            for j in 0..3 {
                kdebug!("[fiber {}] iteration {} on tid {}", i, j, current_tid());
                Fiber::yield_to_ready();
            }
            c.fetch_add(1, Ordering::SeqCst);
        });
        println!("Scheduled fiber {}", fiber.id());
        sched.schedule(fiber);
    }

    // Pinned to the last worker
    if let Some(&tid) = sched.thread_ids().last() {
        let c = completed.clone();
        sched.schedule_on(
            weft::Work::callback(move || {
                kinfo!("[pinned] wanted tid {}, running on {}", tid, current_tid());
                c.fetch_add(1, Ordering::SeqCst);
            }),
            ThreadAffinity::Pinned(tid),
        );
    }

    // A fiber that hops onto the first worker halfway through
    if let Some(&tid) = sched.thread_ids().first() {
        let c = completed.clone();
        let target = sched.clone();
        sched.schedule_fn(move || {
            kinfo!("[hop] before switch_to on tid {}", current_tid());
            target.switch_to(ThreadAffinity::Pinned(tid));
            kinfo!("[hop] after switch_to on tid {} (wanted {})", current_tid(), tid);
            c.fetch_add(1, Ordering::SeqCst);
        });
    }

    println!("\n{}\n", sched);

    // The caller thread joins in here and returns once everything ran
    sched.stop();

    let count = completed.load(Ordering::SeqCst);
    kinfo!("{} task(s) completed, {} live fibers", count, Fiber::total());
    println!("\n=== Example Complete ===");
}
