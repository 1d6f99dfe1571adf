//! Linux futex-based worker parking
//!
//! The futex word is the number of pending permits. `park` takes one if
//! available, otherwise FUTEX_WAITs for the word to leave 0. A waker bumps
//! the word before FUTEX_WAKE, so the kernel's compare in FUTEX_WAIT closes
//! the window between "saw no permit" and "went to sleep".

use super::{WorkerParking, MAX_PERMITS};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Linux futex-based parking
pub struct FutexParking {
    /// Pending permits
    futex: AtomicU32,

    /// Count of parked workers
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    /// Workers currently parked (hint, may be stale)
    #[cfg(test)]
    pub(crate) fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }

    fn try_take(&self) -> bool {
        let mut cur = self.futex.load(Ordering::Acquire);
        while cur > 0 {
            match self.futex.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
        false
    }

    fn post(&self, n: u32) {
        let _ = self.futex.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            Some(cur.saturating_add(n).min(MAX_PERMITS))
        });
    }

    fn futex_wake(&self, n: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for FutexParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.try_take() {
                return true;
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    Some(d - now)
                }
                None => None,
            };
            let timespec = remaining.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let timespec_ptr = match &timespec {
                Some(ts) => ts as *const libc::timespec,
                None => std::ptr::null(),
            };

            self.parked.fetch_add(1, Ordering::SeqCst);
            // Sleeps only while the word is still 0
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.futex.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    0u32,
                    timespec_ptr,
                    std::ptr::null::<u32>(),
                    0u32,
                );
            }
            self.parked.fetch_sub(1, Ordering::SeqCst);
            // Woken, timed out, EAGAIN or EINTR: loop re-checks the permit
            // count and the deadline
        }
    }

    fn wake_one(&self) {
        self.post(1);
        if self.parked.load(Ordering::SeqCst) > 0 {
            self.futex_wake(1);
        }
    }

    fn wake_all(&self, expected: usize) {
        let parked = self.parked.load(Ordering::SeqCst).max(expected).max(1);
        self.post(parked.min(MAX_PERMITS as usize) as u32);
        self.futex_wake(i32::MAX);
    }
}
