//! Minimal parallel-work plumbing: a gang of scoped worker threads for the
//! STW and rebuild tasks, and a suspendible thread set that lets safepoints
//! preempt rebuild workers between chunks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Runs a task on a fixed number of worker threads and joins them all.
pub struct WorkGang {
    name: &'static str,
}

impl WorkGang {
    pub fn new(name: &'static str) -> Self {
        WorkGang { name }
    }

    /// Runs `task(worker_id)` on `workers` threads, returning when all have
    /// finished.
    pub fn run_task<F>(&self, workers: usize, task: F)
    where
        F: Fn(usize) + Sync,
    {
        debug_assert!(workers >= 1);
        trace!("{}: running task on {} workers", self.name, workers);
        std::thread::scope(|scope| {
            for id in 0..workers {
                let task = &task;
                scope.spawn(move || task(id));
            }
        });
    }
}

struct StsSync {
    joined: usize,
    waiting: usize,
    suspended: bool,
}

/// A set of threads that can be suspended cooperatively: members poll
/// `should_yield` at their yield points and park in `yield_to_safepoint`
/// until the requester resumes them. The requester blocks in `suspend_all`
/// until every joined member has parked (or left the set).
pub struct SuspendibleThreadSet {
    sync: Mutex<StsSync>,
    cvar: Condvar,
    suspend_flag: AtomicBool,
}

impl Default for SuspendibleThreadSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendibleThreadSet {
    pub fn new() -> Self {
        SuspendibleThreadSet {
            sync: Mutex::new(StsSync {
                joined: 0,
                waiting: 0,
                suspended: false,
            }),
            cvar: Condvar::new(),
            suspend_flag: AtomicBool::new(false),
        }
    }

    pub fn join(&self) -> StsJoiner<'_> {
        let mut sync = self.sync.lock().unwrap();
        sync.joined += 1;
        StsJoiner { set: self }
    }

    /// Cheap check for a pending suspension request.
    #[inline]
    pub fn should_yield(&self) -> bool {
        self.suspend_flag.load(Ordering::Relaxed)
    }

    /// Parks the calling member until the suspension is over.
    pub fn yield_to_safepoint(&self) {
        let mut sync = self.sync.lock().unwrap();
        if !sync.suspended {
            return;
        }
        sync.waiting += 1;
        self.cvar.notify_all();
        while sync.suspended {
            sync = self.cvar.wait(sync).unwrap();
        }
        sync.waiting -= 1;
    }

    /// Requests suspension and waits until every joined member is parked.
    pub fn suspend_all(&self) {
        self.suspend_flag.store(true, Ordering::Relaxed);
        let mut sync = self.sync.lock().unwrap();
        sync.suspended = true;
        while sync.waiting < sync.joined {
            sync = self.cvar.wait(sync).unwrap();
        }
    }

    pub fn resume_all(&self) {
        let mut sync = self.sync.lock().unwrap();
        sync.suspended = false;
        self.suspend_flag.store(false, Ordering::Relaxed);
        self.cvar.notify_all();
    }
}

/// RAII membership of a [`SuspendibleThreadSet`].
pub struct StsJoiner<'a> {
    set: &'a SuspendibleThreadSet,
}

impl Drop for StsJoiner<'_> {
    fn drop(&mut self) {
        let mut sync = self.set.sync.lock().unwrap();
        sync.joined -= 1;
        // A leaving member may be the last one a suspender is waiting for.
        self.set.cvar.notify_all();
    }
}
