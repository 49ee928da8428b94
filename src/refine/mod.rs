//! Concurrent refinement worker threads.
//!
//! The workers park on a condition variable and are triggered when the main
//! dirty-card queue set accumulates enough completed buffers. Each worker
//! drains whole buffers, refining one card at a time through
//! [`RemSetEngine::refine_card_concurrently`]. Deactivation (around pauses)
//! stops the workers from taking further buffers; cards they leave behind
//! are finished by the pause-time updater.

pub mod hot_card_cache;

pub use self::hot_card_cache::HotCardCache;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::remset::RemSetEngine;

struct GroupSync {
    trigger_count: usize,
    contexts_parked: usize,
}

pub struct ConcurrentRefinement {
    engine: &'static RemSetEngine,
    sync: Mutex<GroupSync>,
    cvar: Condvar,
    deactivated: AtomicBool,
    request_flag: AtomicBool,
    threads: usize,
}

struct RefineWorker {
    group: &'static ConcurrentRefinement,
    id: usize,
    last_trigger_count: usize,
}

impl ConcurrentRefinement {
    /// Spawns the configured number of refinement workers and wires the
    /// queue set's activation hook to them. The group lives until process
    /// exit.
    pub fn spawn(engine: &'static RemSetEngine) -> &'static Self {
        let threads = engine.heap().options().refinement_threads;
        let group: &'static Self = Box::leak(Box::new(ConcurrentRefinement {
            engine,
            sync: Mutex::new(GroupSync {
                trigger_count: 1,
                contexts_parked: 0,
            }),
            cvar: Condvar::new(),
            deactivated: AtomicBool::new(false),
            request_flag: AtomicBool::new(false),
            threads,
        }));
        for id in 0..threads {
            std::thread::spawn(move || {
                let mut worker = RefineWorker {
                    group,
                    id,
                    last_trigger_count: 0,
                };
                worker.run();
            });
        }
        engine
            .dcqs()
            .set_activation_hook(Box::new(move || group.trigger()));
        group
    }

    /// Wakes all parked workers for a refinement round.
    pub fn trigger(&self) {
        if self.request_flag.load(Ordering::Relaxed) {
            return;
        }
        let mut sync = self.sync.lock().unwrap();
        if !self.request_flag.load(Ordering::Relaxed) {
            self.request_flag.store(true, Ordering::Relaxed);
            sync.trigger_count += 1;
            sync.contexts_parked = 0;
            self.cvar.notify_all();
        }
    }

    /// Stops workers from taking further buffers; in flight buffers are
    /// finished. Used around pauses.
    pub fn deactivate(&self) {
        self.deactivated.store(true, Ordering::SeqCst);
    }

    pub fn activate(&self) {
        self.deactivated.store(false, Ordering::SeqCst);
    }
}

impl RefineWorker {
    fn run(&mut self) {
        loop {
            self.park();
            self.refine();
        }
    }

    fn park(&mut self) {
        let group = self.group;
        let mut sync = group.sync.lock().unwrap();
        self.last_trigger_count += 1;
        if self.last_trigger_count == sync.trigger_count {
            sync.contexts_parked += 1;
            if sync.contexts_parked == group.threads {
                group.request_flag.store(false, Ordering::Relaxed);
            }
            group.cvar.notify_all();
            while self.last_trigger_count == sync.trigger_count {
                sync = group.cvar.wait(sync).unwrap();
            }
        }
    }

    fn refine(&self) {
        let group = self.group;
        while !group.deactivated.load(Ordering::SeqCst) {
            let Some(buffer) = group.engine.dcqs().pop_completed_buffer() else {
                break;
            };
            trace!("refine worker {}: buffer of {} cards", self.id, buffer.len());
            for card in &buffer {
                group.engine.refine_card_concurrently(*card, self.id);
            }
            group.engine.dcqs().recycle(buffer);
        }
    }
}
