//! Remembered-set rebuilding after a concurrent marking cycle.
//!
//! Workers claim regions and walk their live objects in fixed-size chunks,
//! re-installing every cross-region reference. Liveness below TAMS comes
//! from the next-mark bitmap; everything in `[TAMS, TARS)` was allocated
//! during marking and is live by construction. TARS is re-read at every
//! chunk boundary because eager reclaim can retire a region mid-rebuild,
//! and each boundary is a yield point for the suspendible thread set.

use std::time::Instant;

use super::RemSetEngine;
use crate::heap::RegionClaimer;
use crate::mark::ConcurrentMarkState;
use crate::policy::region::card::Card;
use crate::policy::region::markbitmap::MarkBitmap;
use crate::policy::region::region::Region;
use crate::scheduler::WorkGang;
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::*;
use crate::vm;

/// Iterator over the live objects intersecting one chunk. Finite and not
/// restartable: positioned at the first object extending into the chunk,
/// advanced object by object, skipping dead ranges via the bitmap.
struct LiveObjIterator<'a> {
    bitmap: &'a MarkBitmap,
    tams: Address,
    mr_start: Address,
    mr_end: Address,
    current: Address,
}

impl<'a> LiveObjIterator<'a> {
    fn new(
        bitmap: &'a MarkBitmap,
        tams: Address,
        mr_start: Address,
        mr_end: Address,
        first_obj_into_mr: Address,
    ) -> Self {
        debug_assert!(
            first_obj_into_mr <= mr_start,
            "first object {:?} should extend into [{:?}, {:?})",
            first_obj_into_mr,
            mr_start,
            mr_end
        );
        let mut it = LiveObjIterator {
            bitmap,
            tams,
            mr_start,
            mr_end,
            current: first_obj_into_mr,
        };
        if it.is_live(it.current) {
            // Non-arrays reaching in from before the chunk were scanned with
            // the previous chunk.
            if it.current < mr_start
                && !vm::is_obj_array(ObjectReference::from_address(it.current))
            {
                it.current = vm::object_end(ObjectReference::from_address(it.current));
                it.move_if_below_tams();
            }
        } else {
            // Only objects below TAMS can be dead, so the bitmap applies.
            it.current = bitmap.next_marked_address(it.current, it.bitmap_limit());
        }
        it
    }

    fn is_below_tams(&self) -> bool {
        self.current < self.tams
    }

    fn is_live(&self, addr: Address) -> bool {
        addr >= self.tams || self.bitmap.is_marked_addr(addr)
    }

    fn bitmap_limit(&self) -> Address {
        self.tams.min(self.mr_end)
    }

    fn move_if_below_tams(&mut self) {
        if self.is_below_tams() && self.has_next() {
            self.current = self
                .bitmap
                .next_marked_address(self.current, self.bitmap_limit());
        }
    }

    fn has_next(&self) -> bool {
        self.current < self.mr_end
    }

    fn next(&self) -> ObjectReference {
        debug_assert!(self.is_live(self.current), "dead object {:?}", self.current);
        ObjectReference::from_address(self.current)
    }

    fn move_to_next(&mut self) {
        self.current = vm::object_end(self.next());
        self.move_if_below_tams();
    }
}

struct RebuildRemSetRegionClosure<'a> {
    engine: &'a RemSetEngine,
    cm: &'a ConcurrentMarkState,
    worker_id: usize,
    chunk_bytes: usize,
}

impl<'a> RebuildRemSetRegionClosure<'a> {
    /// Applies the rebuild closure to the references of `obj`, limiting
    /// object arrays to the chunk. Returns the number of words scanned.
    fn scan_for_references(
        &self,
        region: &Region,
        obj: ObjectReference,
        mr_start: Address,
        mr_end: Address,
    ) -> usize {
        let obj_start = obj.to_address();
        let obj_end = vm::object_end(obj);
        let obj_size = vm::object_size(obj);
        let mut update = |slot: Address| self.engine.update_rem_set_for_slot(region, slot);
        // Non-arrays and arrays completely within the chunk are scanned
        // whole.
        if !vm::is_obj_array(obj) || (obj_start >= mr_start && obj_end <= mr_end) {
            vm::scan_object(obj, &mut update);
            return obj_size;
        }
        // An object array crossing the chunk: only its slots inside the
        // chunk.
        vm::scan_object_in(obj, mr_start, mr_end, &mut update);
        (obj_end.min(mr_end) - obj_start.max(mr_start)) >> LOG_BYTES_IN_WORD
    }

    /// A humongous object is live for rebuilding iff it is marked, or its
    /// TARS exceeds its TAMS (allocated during marking).
    fn is_humongous_live(
        &self,
        obj: ObjectReference,
        bitmap: &MarkBitmap,
        tams: Address,
        tars: Address,
    ) -> bool {
        bitmap.is_marked(obj) || tars > tams
    }

    /// Rebuilds within `[mr_start, mr_end)` of the region. Returns the
    /// number of bytes of scanned objects attributable to the marking, i.e.
    /// parts below TAMS.
    fn rebuild_rem_set_in_region(
        &self,
        bitmap: &MarkBitmap,
        tams: Address,
        tars: Address,
        region: &Region,
        mr_start: Address,
        mr_end: Address,
    ) -> usize {
        debug_assert!(mr_start < mr_end);

        if region.is_humongous() {
            let obj = region.humongous_obj();
            debug_assert!(!obj.is_null());
            if !self.is_humongous_live(obj, bitmap, tams, tars) {
                return 0;
            }
            let mut update = |slot: Address| self.engine.update_rem_set_for_slot(region, slot);
            vm::scan_object_in(obj, mr_start, mr_end, &mut update);
            // TAMS of a humongous region is either bottom (allocated during
            // marking) or top; anything else would point into the object.
            return if tams != region.bottom() {
                mr_end - mr_start
            } else {
                0
            };
        }

        let first = match region
            .block_offset_table()
            .block_start(region.bottom(), Card::of(mr_start))
        {
            Some(first) => first,
            None => return 0,
        };

        let mut marked_words = 0;
        let mut it = LiveObjIterator::new(bitmap, tams, mr_start, mr_end, first);
        while it.has_next() {
            let obj = it.next();
            let scanned = self.scan_for_references(region, obj, mr_start, mr_end);
            if obj.to_address() < tams {
                marked_words += scanned;
            }
            it.move_to_next();
        }
        marked_words << LOG_BYTES_IN_WORD
    }

    /// Returns true to abort the whole task.
    fn do_heap_region(&mut self, region: &Region) -> bool {
        let cm = self.cm;
        if cm.has_aborted() {
            return true;
        }

        let region_idx = region.index();
        let tams = region.next_top_at_mark_start();
        let mut total_marked_bytes = 0usize;

        let mut cur = region.bottom();
        while cur < region.end() {
            // Re-read TARS after every chunk (yield point): it goes away
            // when the region is eagerly reclaimed.
            let tars = match cm.top_at_rebuild_start(region_idx) {
                Some(tars) => tars,
                None => return false,
            };

            let chunk_end = (cur + self.chunk_bytes).min(tars);
            if cur >= chunk_end {
                break;
            }

            let chunk_start_time = Instant::now();
            let marked_bytes = self.rebuild_rem_set_in_region(
                cm.next_mark_bitmap(),
                tams,
                tars,
                region,
                cur,
                chunk_end,
            );
            if self.engine.heap().options().trace_rebuild_rem_set {
                debug!(
                    "worker {}: rebuilt region {} chunk [{:?}, {:?}) time {:?} \
                     marked bytes {} TAMS {:?} TARS {:?}",
                    self.worker_id,
                    region_idx,
                    cur,
                    chunk_end,
                    chunk_start_time.elapsed(),
                    marked_bytes,
                    tams,
                    tars
                );
            }
            total_marked_bytes += marked_bytes;
            cur += self.chunk_bytes;

            cm.do_yield_check();
            if cm.has_aborted() {
                return true;
            }
        }
        // The region might have been eagerly reclaimed during the final
        // iteration; filter those out rather than relying on region type,
        // since new allocations may already have gone in.
        debug_assert!(
            cm.top_at_rebuild_start(region_idx).is_none()
                || total_marked_bytes == region.next_marked_bytes(),
            "marked bytes {} for region {} do not match recorded {} (TAMS {:?})",
            total_marked_bytes,
            region_idx,
            region.next_marked_bytes(),
            tams
        );
        // Abort state may have changed across the yield check.
        cm.has_aborted()
    }
}

impl RemSetEngine {
    /// Rebuilds all remembered sets on `workers`, with the worker count
    /// chosen by the marking scheduler. Workers join the suspendible thread
    /// set so safepoints can pause the rebuild between chunks.
    pub fn rebuild_rem_set(
        &self,
        cm: &ConcurrentMarkState,
        workers: &WorkGang,
        worker_id_offset: usize,
    ) {
        let num_workers = cm.calc_parallel_marking_threads();
        let claimer = RegionClaimer::new(self.heap().region_count(), 1);
        workers.run_task(num_workers, |worker_id| {
            let _joiner = cm.suspendible_threads().join();
            let mut cl = RebuildRemSetRegionClosure {
                engine: self,
                cm,
                worker_id: worker_id_offset + worker_id,
                chunk_bytes: self.heap().options().rebuild_chunk_size,
            };
            self.heap()
                .heap_region_par_iterate_chunked(&claimer, |r| cl.do_heap_region(r));
        });
    }
}
