//! The remembered-set maintenance engine.
//!
//! One instance serves the whole heap. It bridges mutator card logging and
//! the evacuation machinery: concurrent refinement applies dirty cards to
//! remembered sets while mutators run; during a pause the engine finalizes
//! the outstanding logs and enumerates every pointer into the collection
//! set; after marking it scrubs and rebuilds the sets.

mod phase_times;
mod rebuild;
mod scan;
mod summary;

pub use self::phase_times::{GcPhase, PhaseTimes};
pub use self::summary::RemSetSummary;

use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::barrier::{DirtyCardQueue, DirtyCardQueueSet};
use crate::heap::{RegionClaimer, RegionalHeap};
use crate::policy::region::card::*;
use crate::policy::region::cardtable::CardState;
use crate::policy::region::region::Region;
use crate::refine::HotCardCache;
use crate::util::address::{Address, ObjectReference};
use crate::util::bitmap::BitMap;
use crate::vm;

/// The closure the engine pushes discovered references through during a
/// pause. The surrounding collector's evacuation machinery implements it;
/// it is responsible for filtering for targets it cares about (the scan
/// paths deliver every reference found on a claimed card).
pub trait OopPushClosure {
    fn do_oop(&mut self, slot: Address, target: ObjectReference);

    /// Invited to drain part of the evacuation queue, bounding its depth.
    fn trim_queue_partially(&mut self) {}
}

/// Receives the strong code roots attached to collection-set regions.
pub trait CodeRootClosure {
    fn do_code_root(&mut self, root: Address);
}

/// A push closure that drops everything; used when flushing logs for
/// verification, where no collection set exists.
pub struct NoopPushClosure;

impl OopPushClosure for NoopPushClosure {
    fn do_oop(&mut self, _slot: Address, _target: ObjectReference) {}
}

pub struct RemSetEngine {
    heap: &'static RegionalHeap,
    /// Mutator logs and deferred updates.
    dcqs: Arc<DirtyCardQueueSet>,
    /// Cards found to reference the collection set during a pause; discarded
    /// on success, merged back into `dcqs` on evacuation failure.
    into_cset_dcqs: Arc<DirtyCardQueueSet>,
    hot_card_cache: HotCardCache,
    n_workers: usize,
    conc_refined_cards: AtomicUsize,
    cards_scanned: AtomicRefCell<Option<Box<[AtomicUsize]>>>,
    total_cards_scanned: AtomicUsize,
    /// Whether the post-write barrier may enqueue to the dirty-card queues;
    /// disabled inside pauses, where dirtied cards are picked up by cleanup.
    refine_concurrently: AtomicBool,
    prev_period_summary: AtomicRefCell<RemSetSummary>,
    phase_times: PhaseTimes,
}

impl RemSetEngine {
    /// Builds the engine for a booted heap and leaks it; the engine lives
    /// until process exit, like the heap it serves.
    pub fn boot(heap: &'static RegionalHeap) -> &'static Self {
        let options = heap.options();
        let n_workers = options.parallel_gc_threads.max(1);
        let engine: &'static Self = Box::leak(Box::new(RemSetEngine {
            heap,
            dcqs: DirtyCardQueueSet::new(
                options.dcq_buffer_size,
                options.refinement_trigger_buffers,
            ),
            into_cset_dcqs: DirtyCardQueueSet::new(options.dcq_buffer_size, usize::MAX),
            hot_card_cache: HotCardCache::new(heap, options.hot_card_cache_size),
            n_workers,
            conc_refined_cards: AtomicUsize::new(0),
            cards_scanned: AtomicRefCell::new(None),
            total_cards_scanned: AtomicUsize::new(0),
            refine_concurrently: AtomicBool::new(true),
            prev_period_summary: AtomicRefCell::new(RemSetSummary::default()),
            phase_times: PhaseTimes::new(n_workers),
        }));
        if options.summarize_rset_stats {
            engine
                .prev_period_summary
                .borrow_mut()
                .initialize(engine);
        }
        engine
    }

    #[inline]
    pub fn heap(&self) -> &'static RegionalHeap {
        self.heap
    }

    #[inline]
    pub fn dcqs(&self) -> &Arc<DirtyCardQueueSet> {
        &self.dcqs
    }

    #[inline]
    pub fn into_cset_dcqs(&self) -> &Arc<DirtyCardQueueSet> {
        &self.into_cset_dcqs
    }

    #[inline]
    pub fn hot_card_cache(&self) -> &HotCardCache {
        &self.hot_card_cache
    }

    #[inline]
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    #[inline]
    pub fn phase_times(&self) -> &PhaseTimes {
        &self.phase_times
    }

    pub fn conc_refined_cards(&self) -> usize {
        self.conc_refined_cards.load(Ordering::Relaxed)
    }

    pub fn total_cards_scanned(&self) -> usize {
        self.total_cards_scanned.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn refine_cte_cl_concurrency(&self) -> bool {
        self.refine_concurrently.load(Ordering::Relaxed)
    }

    pub fn set_refine_cte_cl_concurrency(&self, concurrent: bool) {
        self.refine_concurrently.store(concurrent, Ordering::Relaxed);
    }

    /// Applies one reference found while refining a card in `from`: inserts
    /// the card covering the slot into the target region's remembered set if
    /// the reference crosses regions.
    #[inline]
    fn update_rem_set_for_slot(&self, from: &Region, slot: Address) {
        let target = vm::read_ref_slot(slot);
        if target.is_null() || !self.heap.contains(target.to_address()) {
            return;
        }
        let to = self.heap.region_of(target.to_address());
        if to.index() != from.index() {
            to.rem_set().add_card(Card::of(slot));
        }
    }

    /// Refines one card concurrently with mutators: trims it against the
    /// region's allocation frontier, scans its contents and installs
    /// cross-region references into the target remembered sets. Hot cards
    /// are diverted through the hot card cache.
    pub fn refine_card_concurrently(&self, card: Card, _worker: usize) {
        debug_assert!(self.heap.contains(card.start()));
        let ct = self.heap.card_table();

        // If the card is no longer dirty, nothing to do.
        if ct.get_acquire(card) != CardState::Dirty {
            return;
        }

        let mut card = card;
        let mut start = card.start();
        let mut region = self.heap.region_of(start);

        // The region could be young: cards for young regions are distinctly
        // marked, but that marking races with the barrier, so a young card
        // can slip past the filter. The card could also be stale because its
        // region was freed since it was recorded; if the region was
        // reallocated as old or humongous, trimming and iteration detect the
        // staleness later. At worst a stale card is processed unnecessarily.
        if !region.is_old_or_humongous() {
            return;
        }

        if self.hot_card_cache.use_cache() {
            match self.hot_card_cache.insert(card) {
                None => return, // buffered, no eviction
                Some(other) if other == card => {} // not hot, keep the card
                Some(evicted) => {
                    // Our card was cached and an older one fell out. The
                    // evicted card's region may have been freed while it sat
                    // in the cache.
                    card = evicted;
                    start = card.start();
                    region = self.heap.region_of(start);
                    if !region.is_old_or_humongous() {
                        return;
                    }
                }
            }
        }

        // Trim to what has been allocated. Humongous allocation publishes
        // top last, so a not-yet-visible top reads as an empty intersection
        // and the card is dropped as stale.
        let scan_limit = region.top();
        if scan_limit <= start {
            return;
        }

        // Clean the card, then fence: the cleaning must be visible before
        // the contents are read so a concurrent re-dirtying is not lost, and
        // the scan must not proceed ahead of the top read above.
        ct.set(card, CardState::Clean);
        fence(Ordering::SeqCst);

        let end = scan_limit.min(start + BYTES_IN_CARD);
        let processed = region.oops_on_card_iterate_careful(start, end, &mut |slot| {
            self.update_rem_set_for_slot(region, slot);
        });

        if !processed {
            // Unparsable heap, e.g. a partially allocated object. The card
            // may be stale, but it has already been cleaned: re-dirty and
            // re-enqueue so a non-stale card is not lost.
            if ct.get_acquire(card) != CardState::Dirty {
                ct.set(card, CardState::Dirty);
                self.dcqs.enqueue_shared(card);
            }
        } else {
            self.conc_refined_cards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Refines one card inside a pause. References into the collection set
    /// are pushed through `push` instead of being installed into remembered
    /// sets (cset regions are about to be emptied). Returns true iff the
    /// card contained such a reference, in which case the caller records the
    /// card in the into-cset queue set.
    pub fn refine_card_during_gc(
        &self,
        card: Card,
        _worker: usize,
        push: &mut dyn OopPushClosure,
    ) -> bool {
        debug_assert!(self.heap.contains(card.start()));
        let ct = self.heap.card_table();

        // Covers cards already scanned as parts of the remembered sets.
        if ct.get_acquire(card) != CardState::Dirty {
            return false;
        }

        let start = card.start();
        let region = self.heap.region_of(start);
        if !region.is_old_or_humongous() {
            return false;
        }

        // Live objects in the collection set are about to move; entries for
        // them would be stale immediately.
        if region.in_collection_set() {
            return false;
        }

        // A card might extend onto a GC allocation tail; scan_top bounds the
        // parsable part.
        let scan_limit = region.scan_top();
        if scan_limit <= start {
            return false;
        }

        ct.set(card, CardState::Clean);
        fence(Ordering::SeqCst);

        let end = scan_limit.min(start + BYTES_IN_CARD);
        let mut has_refs_into_cset = false;
        let processed = region.oops_on_card_iterate_careful(start, end, &mut |slot| {
            let target = vm::read_ref_slot(slot);
            if target.is_null() || !self.heap.contains(target.to_address()) {
                return;
            }
            let to = self.heap.region_of(target.to_address());
            if to.in_collection_set() {
                push.do_oop(slot, target);
                has_refs_into_cset = true;
            } else if to.index() != region.index() {
                to.rem_set().add_card(Card::of(slot));
            }
        });
        assert!(
            processed,
            "unparsable card {:?} below scan_top of {:?}",
            card, region
        );
        self.conc_refined_cards.fetch_add(1, Ordering::Relaxed);

        has_refs_into_cset
    }

    /// Drains the remaining dirty-card logs, starting with the hot card
    /// cache. Cards referencing the collection set go to `into_cset_dcq`.
    fn update_rs(
        &self,
        into_cset_dcq: &DirtyCardQueue,
        worker: usize,
        push: &mut dyn OopPushClosure,
    ) {
        let timer = Instant::now();
        self.hot_card_cache.drain(&mut |card| {
            if self.refine_card_during_gc(card, worker, push) {
                into_cset_dcq.enqueue(card);
            }
        });
        while let Some(buffer) = self.dcqs.pop_completed_buffer() {
            for card in &buffer {
                if self.refine_card_during_gc(*card, worker, push) {
                    push.trim_queue_partially();
                    into_cset_dcq.enqueue(*card);
                }
            }
            self.dcqs.recycle(buffer);
        }
        self.phase_times
            .record(GcPhase::UpdateRs, worker, timer.elapsed());
    }

    /// Once per pause, before any worker runs
    /// [`oops_into_collection_set_do`](Self::oops_into_collection_set_do):
    /// stops concurrent enqueueing, absorbs the mutators' partial log
    /// buffers and sets up the per-worker scan counters.
    pub fn prepare_for_oops_into_collection_set_do(&self) {
        self.set_refine_cte_cl_concurrency(false);
        self.dcqs.concatenate_logs();

        let mut cards_scanned = self.cards_scanned.borrow_mut();
        assert!(cards_scanned.is_none(), "invariant");
        *cards_scanned = Some((0..self.n_workers).map(|_| AtomicUsize::new(0)).collect());
        self.total_cards_scanned.store(0, Ordering::Relaxed);
    }

    /// One worker's share of the pause-time remembered-set work: finish the
    /// outstanding updates, then scan the collection-set remembered sets
    /// and code roots. References into the cset reach `push`; code roots
    /// reach `code_root_cl`.
    pub fn oops_into_collection_set_do(
        &self,
        push: &mut dyn OopPushClosure,
        code_root_cl: &mut dyn CodeRootClosure,
        worker: usize,
    ) {
        assert!(worker < self.n_workers, "sanity");
        let into_cset_dcq = DirtyCardQueue::new(&self.into_cset_dcqs, false);
        self.update_rs(&into_cset_dcq, worker, push);
        self.scan_rs(push, code_root_cl, worker);
        // Dropping the queue flushes the worker's into-cset cards.
    }

    /// Once per pause, after all workers are done: publish the scan totals,
    /// clean the dirtied card ranges and dispose of the into-cset cards --
    /// discarded on success, pushed back into the main queue set when
    /// evacuation failed so the deferred updates are retried.
    pub fn cleanup_after_oops_into_collection_set_do(&self, evacuation_failed: bool) {
        let cards_scanned = self
            .cards_scanned
            .borrow_mut()
            .take();
        assert!(cards_scanned.is_some(), "invariant");
        let total: usize = cards_scanned
            .as_deref()
            .into_iter()
            .flatten()
            .map(|n| n.load(Ordering::Relaxed))
            .sum();
        self.total_cards_scanned.store(total, Ordering::Relaxed);

        self.set_refine_cte_cl_concurrency(true);
        self.heap.cleanup_dirty_cards_regions();

        if evacuation_failed {
            let timer = Instant::now();
            // Objects that failed to move keep their cset-referencing cards
            // relevant; hand them to the main queue set for the next cycle.
            self.dcqs.merge_bufferlists(&self.into_cset_dcqs);
            self.phase_times
                .record(GcPhase::EvacFailRestoreRemSets, 0, timer.elapsed());
        }

        self.into_cset_dcqs.clear();
        assert_eq!(
            self.into_cset_dcqs.completed_buffers_num(),
            0,
            "all buffers should be freed"
        );
    }

    /// Records the per-worker count of cards scanned by the cset scan.
    pub(crate) fn record_cards_scanned(&self, worker: usize, cards_done: usize) {
        let cards_scanned = self.cards_scanned.borrow();
        let slots = cards_scanned.as_ref().expect("invariant");
        slots[worker].store(cards_done, Ordering::Relaxed);
    }

    /// Prunes every region's remembered set against the marking results:
    /// entries whose referring region or card holds no live data are
    /// dropped. Humongous continuation regions share the start region's set
    /// and are skipped.
    pub fn scrub(&self, region_bm: &BitMap, card_bm: &BitMap) {
        let ct = self.heap.card_table();
        for i in 0..self.heap.region_count() {
            let region = self.heap.region(i);
            if !region.is_humongous_cont() {
                region.rem_set().scrub(ct, region_bm, card_bm);
            }
        }
    }

    /// Parallel variant of [`scrub`](Self::scrub); workers share `claimer`.
    pub fn scrub_par(&self, region_bm: &BitMap, card_bm: &BitMap, claimer: &RegionClaimer) {
        let ct = self.heap.card_table();
        self.heap.heap_region_par_iterate_chunked(claimer, |region| {
            if !region.is_humongous_cont() {
                region.rem_set().scrub(ct, region_bm, card_bm);
            }
            false
        });
    }

    /// Resets transient remembered-set iteration state across the heap.
    pub fn cleanup_hrrs(&self) {
        for i in 0..self.heap.region_count() {
            self.heap.region(i).rem_set().reset_for_par_iteration();
        }
    }

    /// If configured, flushes and applies every outstanding dirty-card log
    /// so heap verification sees fully up-to-date remembered sets. The hot
    /// card cache is bypassed for the duration.
    pub fn prepare_for_verify(&self, full_collection: bool) {
        let options = self.heap.options();
        if !options.flush_log_buffers_on_verify {
            return;
        }
        if full_collection && !options.verify_rsets_during_full_gc {
            return;
        }
        self.cleanup_hrrs();
        self.set_refine_cte_cl_concurrency(false);
        self.dcqs.concatenate_logs();

        let use_hot_card_cache = self.hot_card_cache.use_cache();
        self.hot_card_cache.set_use_cache(false);

        {
            let into_cset_dcq = DirtyCardQueue::new(&self.into_cset_dcqs, false);
            let mut discard = NoopPushClosure;
            self.update_rs(&into_cset_dcq, 0, &mut discard);
        }
        self.into_cset_dcqs.clear();

        self.hot_card_cache.set_use_cache(use_hot_card_cache);
        assert_eq!(
            self.dcqs.completed_buffers_num(),
            0,
            "all should be consumed"
        );
    }

    pub fn print_summary_info(&self) {
        let mut current = RemSetSummary::default();
        current.initialize(self);
        current.print_on(" Cumulative RS summary");
    }

    /// Prints the delta since the previous periodic summary, then stores the
    /// current snapshot as the new baseline.
    pub fn print_periodic_summary_info(&self, header: &str) {
        let mut current = RemSetSummary::default();
        current.initialize(self);

        let mut prev = self.prev_period_summary.borrow_mut();
        prev.subtract_from(&current);
        prev.print_on(header);
        prev.set(&current);
    }
}
