//! Worker thread management
//!
//! `WorkerPool::start` spawns named OS threads and does not return until
//! each of them has registered its kernel thread id, so pinning targets
//! are known as soon as the scheduler is started.

use crate::tls::current_tid;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use weft_core::{kprint, kwarn, SchedError, SchedResult, Tid};

/// Counting semaphore with blocking wait
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement it
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    pub fn post(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        self.cond.notify_one();
    }
}

/// One spawned worker
pub struct WorkerThread {
    name: String,
    tid: Tid,
    handle: JoinHandle<()>,
}

impl WorkerThread {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Wait for the thread to exit
    pub fn join(self) {
        if self.handle.join().is_err() {
            kwarn!("worker {} exited by panic", self.name);
        }
    }
}

/// Pool of worker threads
#[derive(Default)]
pub struct WorkerPool {
    workers: Vec<WorkerThread>,
    #[cfg(test)]
    spawn_limit: Option<usize>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `count` threads named `<prefix>_<i>`, each running `worker_fn`
    ///
    /// Returns once every thread has started. On spawn failure the threads
    /// already started stay in the pool.
    pub fn start<F>(&mut self, count: usize, prefix: &str, worker_fn: F) -> SchedResult<()>
    where
        F: Fn() + Send + Sync + Clone + 'static,
    {
        let started = Arc::new(Semaphore::new(0));

        for i in 0..count {
            #[cfg(test)]
            if self.spawn_limit.is_some_and(|limit| self.workers.len() >= limit) {
                return Err(SchedError::Spawn("spawn limit reached".into()));
            }
            let name = format!("{}_{}", prefix, i);
            let tid = Arc::new(AtomicI32::new(0));
            let worker_fn = worker_fn.clone();

            let handle = {
                let name = name.clone();
                let tid = tid.clone();
                let started = started.clone();
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || {
                        tid.store(current_tid().as_raw(), Ordering::Release);
                        kprint::set_thread_name(&name);
                        started.post();
                        worker_fn();
                        kprint::clear_thread_name();
                    })
                    .map_err(|e| SchedError::Spawn(e.to_string()))?
            };

            started.wait();
            self.workers.push(WorkerThread {
                name,
                tid: Tid::new(tid.load(Ordering::Acquire)),
                handle,
            });
        }
        Ok(())
    }

    /// Kernel thread ids of all workers, in spawn order
    pub fn tids(&self) -> Vec<Tid> {
        self.workers.iter().map(WorkerThread::tid).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Fail `start` once the pool holds `limit` threads
    #[cfg(test)]
    pub(crate) fn limit_spawns(&mut self, limit: usize) {
        self.spawn_limit = Some(limit);
    }

    /// Wait for all workers to finish
    pub fn join(self) {
        for worker in self.workers {
            worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_semaphore() {
        let sem = Arc::new(Semaphore::new(0));
        let s = sem.clone();
        let t = thread::spawn(move || {
            s.wait();
            s.wait();
        });
        sem.post();
        sem.post();
        t.join().unwrap();
    }

    #[test]
    fn test_pool_start_records_tids() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicUsize::new(0));
        let (s, r) = (seen.clone(), runs.clone());

        let mut pool = WorkerPool::new();
        pool.start(3, "pool_test", move || {
            s.lock().unwrap().push(current_tid());
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let tids = pool.tids();
        assert_eq!(pool.len(), 3);
        assert!(tids.iter().all(|t| t.as_raw() > 0));
        assert!(!tids.contains(&current_tid()));
        assert_eq!(pool.workers[1].name(), "pool_test_1");

        pool.join();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let mut seen = seen.lock().unwrap().clone();
        let mut expected = tids.clone();
        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
