//! Worker parking
//!
//! Idle workers of a plain `Scheduler` sleep here between run-loop passes;
//! `tickle` wakes them. Wakeups are permits: a `wake_one` that happens
//! before the matching `park` is not lost, the next `park` returns at once.
//! Platform-specific implementations use the most efficient primitive
//! available.

use std::time::Duration;

/// Permits beyond this are dropped; a handful is enough to wake everyone
const MAX_PERMITS: u32 = 64;

/// Platform-specific worker parking mechanism
pub trait WorkerParking: Send + Sync {
    /// Sleep until a permit is available or `timeout` passes
    ///
    /// Returns `true` if a permit was consumed. Callers re-check for work
    /// either way.
    fn park(&self, timeout: Option<Duration>) -> bool;

    /// Post one permit, waking a parked worker if there is one
    fn wake_one(&self);

    /// Wake every parked worker
    ///
    /// Posts at least `expected` permits so workers that are about to park
    /// return at once too.
    fn wake_all(&self, expected: usize);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::FallbackParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn WorkerParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = new_parking();
        let start = Instant::now();
        assert!(!parking.park(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_wake_before_park_is_kept() {
        let parking = new_parking();
        parking.wake_one();
        let start = Instant::now();
        assert!(parking.park(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        // Permit was consumed
        assert!(!parking.park(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_wake_one_wakes_parked_thread() {
        let parking = Arc::new(PlatformParking::new());
        let p = parking.clone();
        let sleeper = thread::spawn(move || p.park(Some(Duration::from_secs(10))));

        while parking.parked_count() == 0 {
            thread::yield_now();
        }
        parking.wake_one();
        assert!(sleeper.join().unwrap());
    }

    #[test]
    fn test_wake_all() {
        let parking = Arc::new(PlatformParking::new());
        let sleepers: Vec<_> = (0..3)
            .map(|_| {
                let p = parking.clone();
                thread::spawn(move || p.park(Some(Duration::from_secs(10))))
            })
            .collect();

        while parking.parked_count() < 3 {
            thread::yield_now();
        }
        parking.wake_all(3);
        for s in sleepers {
            assert!(s.join().unwrap());
        }
    }
}
