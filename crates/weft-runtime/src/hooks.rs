//! Scheduler extension points
//!
//! The run loop knows nothing about what an idle worker waits on. It calls
//! through `SchedulerHooks` for the three decisions that depend on it:
//! how to wake an idle worker, what an idle worker does, and when the
//! scheduler may shut down. The reactor in weft-io is one implementation;
//! `ParkingHooks` is the plain one.

use crate::fiber::Fiber;
use crate::parking::{new_parking, WorkerParking};
use crate::scheduler::Scheduler;
use std::any::Any;
use std::time::Duration;

/// Capabilities the run loop delegates
///
/// `Any` lets a layered crate recover its own hooks type from
/// [`Scheduler::hooks`] by downcasting.
pub trait SchedulerHooks: Any + Send + Sync {
    /// Wake (at least) one idle worker so it rescans the queue
    fn tickle(&self, scheduler: &Scheduler);

    /// Wake every idle worker so each rechecks `stopping`
    fn tickle_all(&self, scheduler: &Scheduler) {
        for _ in 0..scheduler.worker_count() {
            self.tickle(scheduler);
        }
    }

    /// Body of each worker's idle fiber
    ///
    /// Must yield (`Fiber::yield_to_hold`) whenever new work may exist and
    /// return once `scheduler.stopping()` holds; returning ends the worker.
    fn idle(&self, scheduler: &Scheduler);

    /// Termination predicate; extend, never weaken, the base condition
    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.base_stopping()
    }
}

/// Idle workers sleep on a parking primitive; tickle posts a permit
pub struct ParkingHooks {
    parking: Box<dyn WorkerParking>,
    timeout: Duration,
}

impl ParkingHooks {
    /// `timeout` bounds each sleep so the stop condition is rechecked
    pub fn new(timeout: Duration) -> Self {
        Self {
            parking: new_parking(),
            timeout,
        }
    }
}

impl SchedulerHooks for ParkingHooks {
    fn tickle(&self, _scheduler: &Scheduler) {
        self.parking.wake_one();
    }

    fn tickle_all(&self, scheduler: &Scheduler) {
        self.parking.wake_all(scheduler.worker_count());
    }

    fn idle(&self, scheduler: &Scheduler) {
        while !scheduler.stopping() {
            self.parking.park(Some(self.timeout));
            Fiber::yield_to_hold();
        }
    }
}
