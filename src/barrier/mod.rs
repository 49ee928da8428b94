//! Dirty-card logging: the post-write barrier, per-thread dirty-card queues
//! and the queue sets that aggregate their completed buffers.
//!
//! Two distinguished sets exist in a running engine: the main set fed by
//! mutator barriers (and by deferred updates), and the into-cset set that the
//! pause-time updater fills with cards found to reference the collection set,
//! kept aside in case the pause has to be rolled back.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::heap::RegionalHeap;
use crate::policy::region::card::Card;
use crate::policy::region::cardtable::CardState;
use crate::remset::RemSetEngine;
use crate::util::address::{Address, ObjectReference};
use crate::vm;

type Buffer = Vec<Card>;

/// A set of dirty-card queues: bounded per-thread buffers that overflow into
/// a shared list of completed buffers, plus a locked shared queue for
/// enqueues made outside any thread-local buffer (the refinement re-enqueue
/// path).
pub struct DirtyCardQueueSet {
    buffer_size: usize,
    completed: Mutex<Vec<Buffer>>,
    /// The shared queue; its mutex is the lock the refiner holds while
    /// re-enqueuing a failed card.
    shared: Mutex<Buffer>,
    /// Per-thread buffers registered for `concatenate_logs`.
    queues: Mutex<Vec<Weak<QueueInner>>>,
    free_buffers: SegQueue<Buffer>,
    processed_buffers: AtomicUsize,
    trigger_threshold: usize,
    activation_hook: spin::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

struct QueueInner {
    buffer: spin::Mutex<Buffer>,
}

impl DirtyCardQueueSet {
    pub fn new(buffer_size: usize, trigger_threshold: usize) -> Arc<Self> {
        debug_assert!(buffer_size >= 1);
        Arc::new(DirtyCardQueueSet {
            buffer_size,
            completed: Mutex::new(vec![]),
            shared: Mutex::new(vec![]),
            queues: Mutex::new(vec![]),
            free_buffers: SegQueue::new(),
            processed_buffers: AtomicUsize::new(0),
            trigger_threshold,
            activation_hook: spin::Mutex::new(None),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Installs the hook run when the completed-buffer count crosses the
    /// activation threshold; used to wake the concurrent refinement workers.
    pub fn set_activation_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.activation_hook.lock() = Some(hook);
    }

    fn take_buffer(&self) -> Buffer {
        self.free_buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    /// Returns a consumed buffer to the pool.
    pub fn recycle(&self, mut buffer: Buffer) {
        self.processed_buffers.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        self.free_buffers.push(buffer);
    }

    pub fn enqueue_completed_buffer(&self, buffer: Buffer) {
        if buffer.is_empty() {
            self.free_buffers.push(buffer);
            return;
        }
        let outstanding = {
            let mut completed = self.completed.lock().unwrap();
            completed.push(buffer);
            completed.len()
        };
        if outstanding > self.trigger_threshold {
            if let Some(hook) = self.activation_hook.lock().as_ref() {
                hook();
            }
        }
    }

    pub fn pop_completed_buffer(&self) -> Option<Buffer> {
        self.completed.lock().unwrap().pop()
    }

    pub fn completed_buffers_num(&self) -> usize {
        self.completed.lock().unwrap().len()
    }

    pub fn processed_buffers_num(&self) -> usize {
        self.processed_buffers.load(Ordering::Relaxed)
    }

    /// Enqueues a single card through the shared queue, holding its lock.
    pub fn enqueue_shared(&self, card: Card) {
        let mut shared = self.shared.lock().unwrap();
        shared.push(card);
        if shared.len() >= self.buffer_size {
            let full = std::mem::replace(&mut *shared, self.take_buffer());
            drop(shared);
            self.enqueue_completed_buffer(full);
        }
    }

    /// Absorbs all partially-filled registered buffers and the shared queue
    /// into the completed-buffer list. Called with mutators stopped.
    pub fn concatenate_logs(&self) {
        let mut queues = self.queues.lock().unwrap();
        queues.retain(|weak| match weak.upgrade() {
            Some(inner) => {
                let mut buffer = inner.buffer.lock();
                if !buffer.is_empty() {
                    let full = std::mem::replace(&mut *buffer, self.take_buffer());
                    self.enqueue_completed_buffer(full);
                }
                true
            }
            None => false,
        });
        drop(queues);
        let mut shared = self.shared.lock().unwrap();
        if !shared.is_empty() {
            let full = std::mem::replace(&mut *shared, self.take_buffer());
            drop(shared);
            self.enqueue_completed_buffer(full);
        }
    }

    /// Moves all of `other`'s completed buffers into this set.
    pub fn merge_bufferlists(&self, other: &DirtyCardQueueSet) {
        let mut stolen = {
            let mut completed = other.completed.lock().unwrap();
            std::mem::take(&mut *completed)
        };
        self.completed.lock().unwrap().append(&mut stolen);
    }

    /// Discards and frees all completed buffers.
    pub fn clear(&self) {
        let buffers = {
            let mut completed = self.completed.lock().unwrap();
            std::mem::take(&mut *completed)
        };
        for mut buffer in buffers {
            buffer.clear();
            self.free_buffers.push(buffer);
        }
    }
}

/// A handle on one dirty-card buffer feeding a [`DirtyCardQueueSet`].
pub struct DirtyCardQueue {
    inner: Arc<QueueInner>,
    set: Arc<DirtyCardQueueSet>,
}

impl DirtyCardQueue {
    /// Creates a queue feeding `set`. Registered queues are absorbed by
    /// `concatenate_logs`; unregistered ones (e.g. the per-worker into-cset
    /// queues) flush on drop only.
    pub fn new(set: &Arc<DirtyCardQueueSet>, registered: bool) -> DirtyCardQueue {
        let inner = Arc::new(QueueInner {
            buffer: spin::Mutex::new(set.take_buffer()),
        });
        if registered {
            set.queues.lock().unwrap().push(Arc::downgrade(&inner));
        }
        DirtyCardQueue {
            inner,
            set: set.clone(),
        }
    }

    pub fn enqueue(&self, card: Card) {
        let mut buffer = self.inner.buffer.lock();
        buffer.push(card);
        if buffer.len() >= self.set.buffer_size {
            let full = std::mem::replace(&mut *buffer, self.set.take_buffer());
            drop(buffer);
            self.set.enqueue_completed_buffer(full);
        }
    }

    /// Pushes the buffered cards to the set even if the buffer is not full.
    pub fn flush(&self) {
        let mut buffer = self.inner.buffer.lock();
        if !buffer.is_empty() {
            let full = std::mem::replace(&mut *buffer, self.set.take_buffer());
            drop(buffer);
            self.set.enqueue_completed_buffer(full);
        }
    }
}

impl Drop for DirtyCardQueue {
    fn drop(&mut self) {
        self.flush();
    }
}

/// A mutator context: owns the thread's dirty-card queue and applies the
/// post-write barrier.
pub struct Mutator {
    heap: &'static RegionalHeap,
    engine: &'static RemSetEngine,
    dcq: DirtyCardQueue,
}

impl Mutator {
    pub fn new(engine: &'static RemSetEngine) -> Self {
        Mutator {
            heap: engine.heap(),
            engine,
            dcq: DirtyCardQueue::new(engine.dcqs(), true),
        }
    }

    /// Stores `target` into the reference slot and runs the post-write
    /// barrier: the field store happens-before the card dirtying.
    pub fn write_ref(&self, slot: Address, target: ObjectReference) {
        vm::store_ref_slot(slot, target);
        self.post_write_barrier(slot);
    }

    /// Dirties and logs the card covering `slot` unless the card is young
    /// (young-generation stores need no remembered sets) or already dirty.
    ///
    /// The fence pairs with the refiner's clean-then-fence: either this
    /// thread observes the refiner's clean and re-dirties, or the refiner's
    /// post-fence scan observes the stored value.
    pub fn post_write_barrier(&self, slot: Address) {
        std::sync::atomic::fence(Ordering::SeqCst);
        let ct = self.heap.card_table();
        let card = Card::of(slot);
        match ct.get(card) {
            CardState::Young | CardState::Dirty => {}
            _ => {
                ct.set_release(card, CardState::Dirty);
                if self.engine.refine_cte_cl_concurrency() {
                    self.dcq.enqueue(card);
                }
            }
        }
    }

    pub fn flush(&self) {
        self.dcq.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::address::Address;

    fn card(i: usize) -> Card {
        Card::of(Address::from_usize(0x10_0000 + i * 512))
    }

    #[test]
    fn buffers_overflow_into_completed() {
        let set = DirtyCardQueueSet::new(4, usize::MAX);
        let queue = DirtyCardQueue::new(&set, true);
        for i in 0..9 {
            queue.enqueue(card(i));
        }
        assert_eq!(set.completed_buffers_num(), 2);
        set.concatenate_logs();
        assert_eq!(set.completed_buffers_num(), 3);
        let total: usize = std::iter::from_fn(|| set.pop_completed_buffer())
            .map(|b| {
                let n = b.len();
                set.recycle(b);
                n
            })
            .sum();
        assert_eq!(total, 9);
        assert_eq!(set.processed_buffers_num(), 3);
    }

    #[test]
    fn shared_queue_flushes_at_capacity() {
        let set = DirtyCardQueueSet::new(2, usize::MAX);
        set.enqueue_shared(card(0));
        assert_eq!(set.completed_buffers_num(), 0);
        set.enqueue_shared(card(1));
        assert_eq!(set.completed_buffers_num(), 1);
        set.enqueue_shared(card(2));
        set.concatenate_logs();
        assert_eq!(set.completed_buffers_num(), 2);
    }

    #[test]
    fn merge_moves_everything() {
        let a = DirtyCardQueueSet::new(2, usize::MAX);
        let b = DirtyCardQueueSet::new(2, usize::MAX);
        let q = DirtyCardQueue::new(&b, false);
        q.enqueue(card(0));
        q.flush();
        assert_eq!(b.completed_buffers_num(), 1);
        a.merge_bufferlists(&b);
        assert_eq!(a.completed_buffers_num(), 1);
        assert_eq!(b.completed_buffers_num(), 0);
        b.clear();
        a.clear();
        assert_eq!(a.completed_buffers_num(), 0);
    }

    #[test]
    fn activation_hook_fires_past_threshold() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let set = DirtyCardQueueSet::new(1, 1);
        let fired = Arc::new(AtomicUsize::new(0));
        let witness = fired.clone();
        set.set_activation_hook(Box::new(move || {
            witness.fetch_add(1, Ordering::SeqCst);
        }));
        let q = DirtyCardQueue::new(&set, false);
        q.enqueue(card(0));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        q.enqueue(card(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
