use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::heap::RegionalHeap;
use crate::policy::region::card::Card;
use crate::util::address::Address;

/// A fixed-capacity evicting buffer that delays the refinement of frequently
/// dirtied ("hot") cards. Hotness is decided by the card table's per-card
/// count against the configured threshold.
///
/// `insert` is three-valued, mirrored by the caller:
/// * `Some(card)` with the original card: the card is not (yet) hot, or the
///   cache is bypassed; process it now.
/// * `None`: the card was cached, no eviction; nothing further to do.
/// * `Some(other)`: the card was cached and evicted `other`, which must be
///   processed now (after re-checking its region, which may have been freed
///   while the card sat in the cache).
pub struct HotCardCache {
    heap: &'static RegionalHeap,
    entries: Box<[AtomicUsize]>,
    idx: AtomicUsize,
    enabled: AtomicBool,
    inserts: AtomicUsize,
    evictions: AtomicUsize,
}

impl HotCardCache {
    pub fn new(heap: &'static RegionalHeap, capacity: usize) -> Self {
        HotCardCache {
            heap,
            entries: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            idx: AtomicUsize::new(0),
            enabled: AtomicBool::new(capacity > 0),
            inserts: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn use_cache(&self) -> bool {
        !self.entries.is_empty() && self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_use_cache(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn insert(&self, card: Card) -> Option<Card> {
        if !self.heap.card_table().inc_hotness(card) {
            // Not hot enough to cache yet.
            return Some(card);
        }
        self.inserts.fetch_add(1, Ordering::Relaxed);
        let slot = self.idx.fetch_add(1, Ordering::Relaxed) % self.entries.len();
        let previous = self.entries[slot].swap(card.start().as_usize(), Ordering::AcqRel);
        if previous == 0 {
            None
        } else {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            Some(Card::from_aligned(Address::from_usize(previous)))
        }
    }

    /// Empties the cache, applying `f` to every cached card. Run at the
    /// start of pause-time RS updating so deferred cards are not lost.
    pub fn drain<F: FnMut(Card)>(&self, f: &mut F) {
        for entry in self.entries.iter() {
            let raw = entry.swap(0, Ordering::AcqRel);
            if raw != 0 {
                f(Card::from_aligned(Address::from_usize(raw)));
            }
        }
    }

    pub fn cache_inserts(&self) -> usize {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn cache_evictions(&self) -> usize {
        self.evictions.load(Ordering::Relaxed)
    }
}
