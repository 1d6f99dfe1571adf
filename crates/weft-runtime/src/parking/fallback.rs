//! Fallback parking using std::sync::Condvar
//!
//! Used on platforms without futex support. Same permit semantics as the
//! futex version, with the count kept under the mutex.

use super::{WorkerParking, MAX_PERMITS};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Condvar-based parking (fallback)
pub struct FallbackParking {
    /// Pending permits
    permits: Mutex<u32>,

    condvar: Condvar,

    /// Count of parked workers
    parked: AtomicUsize,
}

impl FallbackParking {
    pub fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    /// Workers currently parked (hint, may be stale)
    #[cfg(test)]
    pub(crate) fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FallbackParking {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerParking for FallbackParking {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut permits = self.lock();

        self.parked.fetch_add(1, Ordering::SeqCst);
        let took = loop {
            if *permits > 0 {
                *permits -= 1;
                break true;
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        break false;
                    }
                    permits = self
                        .condvar
                        .wait_timeout(permits, d - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    permits = self.condvar.wait(permits).unwrap_or_else(PoisonError::into_inner);
                }
            }
        };
        self.parked.fetch_sub(1, Ordering::SeqCst);
        took
    }

    fn wake_one(&self) {
        {
            let mut permits = self.lock();
            *permits = (*permits + 1).min(MAX_PERMITS);
        }
        self.condvar.notify_one();
    }

    fn wake_all(&self, expected: usize) {
        {
            let mut permits = self.lock();
            let parked = self.parked.load(Ordering::SeqCst).max(expected).max(1);
            let parked = parked.min(MAX_PERMITS as usize) as u32;
            *permits = permits.saturating_add(parked).min(MAX_PERMITS);
        }
        self.condvar.notify_all();
    }
}
