//! The marking-side artifacts the engine consumes: the next-mark bitmap
//! (owned by the heap), per-region top-at-rebuild-start watermarks, and the
//! yield/abort signals of the marking scheduler.

use atomic::{Atomic, Ordering};
use std::sync::atomic::AtomicBool;

use crate::heap::RegionalHeap;
use crate::policy::region::markbitmap::MarkBitmap;
use crate::policy::region::region::RegionType;
use crate::scheduler::SuspendibleThreadSet;
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::*;
use crate::vm;

pub struct ConcurrentMarkState {
    heap: &'static RegionalHeap,
    /// Top-at-rebuild-start per region; zero means the region was retired
    /// (e.g. eagerly reclaimed) and rebuild must skip it.
    tars: Box<[Atomic<Address>]>,
    aborted: AtomicBool,
    sts: SuspendibleThreadSet,
    parallel_marking_threads: usize,
}

impl ConcurrentMarkState {
    pub fn new(heap: &'static RegionalHeap, parallel_marking_threads: usize) -> Self {
        ConcurrentMarkState {
            heap,
            tars: (0..heap.region_count())
                .map(|_| Atomic::new(Address::ZERO))
                .collect(),
            aborted: AtomicBool::new(false),
            sts: SuspendibleThreadSet::new(),
            parallel_marking_threads: parallel_marking_threads.max(1),
        }
    }

    pub fn next_mark_bitmap(&self) -> &MarkBitmap {
        self.heap.mark_bitmap()
    }

    pub fn suspendible_threads(&self) -> &SuspendibleThreadSet {
        &self.sts
    }

    pub fn calc_parallel_marking_threads(&self) -> usize {
        self.parallel_marking_threads
    }

    /// Latches every old/humongous region's current top as its TARS. Called
    /// when rebuilding is scheduled, after marking has finished.
    pub fn snapshot_rebuild_tops(&self) {
        for i in 0..self.heap.region_count() {
            let region = self.heap.region(i);
            let tars = if region.is_old_or_humongous() {
                region.top()
            } else {
                Address::ZERO
            };
            self.tars[i].store(tars, Ordering::Release);
        }
    }

    pub fn top_at_rebuild_start(&self, region_index: usize) -> Option<Address> {
        let tars = self.tars[region_index].load(Ordering::Acquire);
        if tars.is_zero() {
            None
        } else {
            Some(tars)
        }
    }

    /// Retires the region from rebuilding, e.g. on eager reclaim.
    pub fn clear_top_at_rebuild_start(&self, region_index: usize) {
        self.tars[region_index].store(Address::ZERO, Ordering::Release);
    }

    pub fn has_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn set_aborted(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }

    pub fn clear_aborted(&self) {
        self.aborted.store(false, Ordering::Relaxed);
    }

    /// The cooperative checkpoint rebuild workers hit between chunks.
    pub fn do_yield_check(&self) {
        if self.sts.should_yield() {
            self.sts.yield_to_safepoint();
        }
    }

    /// Marks an object on the next-mark bitmap and, when it lies below its
    /// region's TAMS, accounts its bytes as marked. Humongous objects
    /// distribute their bytes over every spanned region, matching how the
    /// rebuild accounts them chunk by chunk.
    pub fn mark_object(&self, object: ObjectReference) {
        if !self.next_mark_bitmap().mark(object) {
            return;
        }
        let start = object.to_address();
        let region = self.heap.region_of(start);
        if start >= region.next_top_at_mark_start() {
            return;
        }
        let bytes = vm::object_size(object) << LOG_BYTES_IN_WORD;
        if region.typ() == RegionType::HumongousStart {
            let end = start + bytes;
            let mut index = region.index();
            loop {
                let r = self.heap.region(index);
                let covered = end.min(r.end()) - r.bottom();
                r.add_next_marked_bytes(covered);
                if end <= r.end() {
                    break;
                }
                index += 1;
            }
        } else {
            region.add_next_marked_bytes(bytes);
        }
    }
}
