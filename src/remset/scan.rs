//! Pause-time scanning of the collection-set remembered sets.
//!
//! Workers iterate the cset twice from worker-biased offsets. On the first
//! pass a worker must claim a region's RS iteration exclusively; on the
//! second pass everyone services blocks other workers have not consumed.
//! Within a region, cards are claimed in blocks of `scan_block_size` ranks
//! to bound contention, and each card is claimed lazily on the card table so
//! intersecting remembered sets do not cause duplicate scans.

use std::time::{Duration, Instant};

use super::{CodeRootClosure, GcPhase, OopPushClosure, RemSetEngine};
use crate::policy::region::card::*;
use crate::policy::region::region::Region;
use crate::vm;

struct ScanRsClosure<'a> {
    engine: &'a RemSetEngine,
    push: &'a mut dyn OopPushClosure,
    code_root_cl: &'a mut dyn CodeRootClosure,
    worker: usize,
    block_size: usize,
    try_claimed: bool,
    cards: usize,
    cards_done: usize,
    strong_code_root_scan_time: Duration,
}

impl<'a> ScanRsClosure<'a> {
    fn do_heap_region(&mut self, region: &Region) {
        debug_assert!(
            region.in_collection_set(),
            "should only be called on elements of the cset"
        );
        let hrrs = region.rem_set();
        if hrrs.iter_is_complete() {
            return; // All done.
        }
        if !self.try_claimed && !hrrs.claim_iter() {
            return;
        }
        self.engine.heap().push_dirty_cards_region(region);
        // Either we work on claimed-but-not-complete regions, or we
        // successfully claimed this one.

        let block_size = self.block_size;
        let mut jump_to_card = hrrs.iter_claimed_next(block_size);
        let mut current_card = 0usize;
        hrrs.iterate(|card| {
            if current_card >= jump_to_card + block_size {
                jump_to_card = hrrs.iter_claimed_next(block_size);
            }
            if current_card >= jump_to_card {
                self.process_card(card);
            }
            current_card += 1;
        });

        if !self.try_claimed {
            self.scan_strong_code_roots(region);
            hrrs.set_iter_complete();
        }
    }

    fn process_card(&mut self, card: Card) {
        let heap = self.engine.heap();
        let ct = heap.card_table();
        let card_region = heap.region_of(card.start());
        self.cards += 1;

        if !card_region.is_on_dirty_cards_region_list() {
            heap.push_dirty_cards_region(card_region);
        }

        // If the card is dirty, it will be picked up by the update phase.
        if !card_region.in_collection_set() && !ct.is_dirty(card) {
            self.scan_card(ct.index_for(card), card_region);
        }
    }

    fn scan_card(&mut self, index: usize, region: &Region) {
        let ct = self.engine.heap().card_table();
        let card_start = ct.addr_for_index(index);
        let end = region.scan_top().min(card_start + BYTES_IN_CARD);
        if card_start < end && !ct.is_card_claimed(index) {
            // Claim lazily, so races are possible but benign: duplicate
            // scans are merely wasteful.
            ct.set_card_claimed(index);
            self.cards_done += 1;
            let engine = self.engine;
            let push = &mut *self.push;
            let parsable = region.oops_on_card_iterate_careful(card_start, end, &mut |slot| {
                let target = vm::read_ref_slot(slot);
                if !target.is_null() && engine.heap().contains(target.to_address()) {
                    push.do_oop(slot, target);
                }
            });
            debug_assert!(parsable, "cset scan hit unparsable card below scan_top");
        }
    }

    fn scan_strong_code_roots(&mut self, region: &Region) {
        let scan_start = Instant::now();
        let code_root_cl = &mut *self.code_root_cl;
        region.strong_code_roots_do(&mut |root| code_root_cl.do_code_root(root));
        self.push.trim_queue_partially();
        self.strong_code_root_scan_time += scan_start.elapsed();
    }
}

impl RemSetEngine {
    pub(super) fn scan_rs(
        &self,
        push: &mut dyn OopPushClosure,
        code_root_cl: &mut dyn CodeRootClosure,
        worker: usize,
    ) {
        let rs_time_start = Instant::now();
        let mut cl = ScanRsClosure {
            engine: self,
            push,
            code_root_cl,
            worker,
            block_size: self.heap().options().scan_block_size.max(1),
            try_claimed: false,
            cards: 0,
            cards_done: 0,
            strong_code_root_scan_time: Duration::ZERO,
        };
        self.heap()
            .collection_set_iterate_from(worker, self.n_workers(), |r| cl.do_heap_region(r));
        cl.try_claimed = true;
        self.heap()
            .collection_set_iterate_from(worker, self.n_workers(), |r| cl.do_heap_region(r));

        let scan_rs_time = rs_time_start
            .elapsed()
            .saturating_sub(cl.strong_code_root_scan_time);
        self.record_cards_scanned(worker, cl.cards_done);
        self.phase_times()
            .record(GcPhase::ScanRs, worker, scan_rs_time);
        self.phase_times()
            .record(GcPhase::CodeRoots, worker, cl.strong_code_root_scan_time);
        trace!(
            "worker {}: cset scan looked up {} cards, scanned {}",
            cl.worker,
            cl.cards,
            cl.cards_done
        );
    }
}
