//! The regional heap: one contiguous mapped range carved into fixed-size
//! regions, with the region metadata table, the card table and the mark
//! bitmap hanging off it.
//!
//! The heap is a process-lifetime structure: `boot` leaks it and every
//! component holds non-owning `&'static` references.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::policy::region::card::*;
use crate::policy::region::cardtable::{CardState, CardTable};
use crate::policy::region::markbitmap::MarkBitmap;
use crate::policy::region::region::*;
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::*;
use crate::util::memory::{self, MmapError};
use crate::util::options::Options;
use crate::vm;

pub struct RegionalHeap {
    start: Address,
    heap_size: usize,
    options: Options,
    regions: Box<[Region]>,
    card_table: CardTable,
    mark_bitmap: MarkBitmap,
    alloc_lock: spin::Mutex<()>,
    collection_set: spin::Mutex<Vec<usize>>,
    dirty_cards_regions: spin::Mutex<Vec<usize>>,
}

impl RegionalHeap {
    /// Reserves the heap range and builds the side tables. The returned
    /// reference is leaked; the heap lives until process exit.
    pub fn boot(options: Options) -> Result<&'static Self, MmapError> {
        let heap_size = options.heap_size;
        assert!(
            heap_size > 0 && heap_size % BYTES_IN_REGION == 0,
            "heap size must be a multiple of the region size"
        );
        let start = memory::reserve_aligned(heap_size, BYTES_IN_REGION)?;
        let regions_in_heap = heap_size >> LOG_BYTES_IN_REGION;
        let regions: Box<[Region]> = (0..regions_in_heap)
            .map(|i| {
                Region::new(
                    i,
                    start + (i << LOG_BYTES_IN_REGION),
                    start,
                    regions_in_heap,
                )
            })
            .collect();
        let heap = Box::leak(Box::new(RegionalHeap {
            start,
            heap_size,
            card_table: CardTable::new(start, heap_size, options.hot_card_threshold),
            mark_bitmap: MarkBitmap::new(start, heap_size),
            options,
            regions,
            alloc_lock: spin::Mutex::new(()),
            collection_set: spin::Mutex::new(vec![]),
            dirty_cards_regions: spin::Mutex::new(vec![]),
        }));
        info!(
            "heap [{:?}, {:?}), {} regions",
            heap.start,
            heap.end(),
            heap.region_count()
        );
        Ok(heap)
    }

    #[inline]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.start + self.heap_size
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end()
    }

    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn region(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    #[inline]
    pub fn region_index_of(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr), "{:?} outside the heap", addr);
        (addr - self.start) >> LOG_BYTES_IN_REGION
    }

    /// The region containing the address.
    #[inline]
    pub fn region_of(&self, addr: Address) -> &Region {
        &self.regions[self.region_index_of(addr)]
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[inline]
    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    #[inline]
    pub fn mark_bitmap(&self) -> &MarkBitmap {
        &self.mark_bitmap
    }

    /// Allocates a free region as young or old. Young regions get their card
    /// range set to the distinguishing young value so the post-write barrier
    /// can filter their stores.
    pub fn alloc_region(&self, typ: RegionType) -> Option<&Region> {
        debug_assert!(matches!(typ, RegionType::Young | RegionType::Old));
        let _guard = self.alloc_lock.lock();
        let region = self.regions.iter().find(|r| r.is_free())?;
        region.reset();
        if typ == RegionType::Young {
            self.card_table
                .clear_range(region.bottom(), region.end(), CardState::Young);
        }
        region.set_type(typ);
        Some(region)
    }

    /// Allocates a humongous object spanning however many contiguous regions
    /// `total_words` needs. The object header is published before any
    /// region's `top` is raised: a concurrent refiner that has not yet
    /// observed the top store sees an empty trimmed range and drops the card.
    pub fn alloc_humongous(&self, total_words: usize) -> Option<ObjectReference> {
        debug_assert!(total_words >= vm::MIN_OBJECT_WORDS);
        let bytes = total_words << LOG_BYTES_IN_WORD;
        let spanned = (bytes + BYTES_IN_REGION - 1) >> LOG_BYTES_IN_REGION;
        let _guard = self.alloc_lock.lock();
        let first = self.find_contiguous_free(spanned)?;
        let obj_start = self.regions[first].bottom();
        let obj = ObjectReference::from_address(obj_start);
        let obj_end = obj_start + bytes;
        for i in first..first + spanned {
            let region = &self.regions[i];
            region.reset();
            region.set_humongous_obj(obj);
            region.set_type(if i == first {
                RegionType::HumongousStart
            } else {
                RegionType::HumongousCont
            });
            region
                .block_offset_table()
                .update_for_alloc(region.bottom(), obj_start, obj_end);
        }
        vm::publish_object(obj_start, total_words, false);
        // Top is published last.
        for i in first..first + spanned {
            let region = &self.regions[i];
            region.set_top(obj_end.min(region.end()));
        }
        Some(obj)
    }

    fn find_contiguous_free(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for (i, region) in self.regions.iter().enumerate() {
            if region.is_free() {
                run += 1;
                if run == count {
                    return Some(i + 1 - count);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Frees a region, zeroing its used memory and resetting its metadata
    /// and card bytes. Remembered-set entries in other regions that name
    /// cards here become stale and are dropped by the refinement predicates
    /// or by scrubbing.
    pub fn free_region(&self, region: &Region) {
        let used = region.top() - region.bottom();
        region.set_type(RegionType::Free);
        if used > 0 {
            memory::zero(region.bottom(), used);
        }
        region.reset();
        self.card_table
            .clear_range(region.bottom(), region.end(), CardState::Clean);
    }

    /// Allocates and publishes an object with `slots` reference slots in the
    /// given region, maintaining the block-offset table.
    pub fn alloc_object(
        &self,
        region: &Region,
        slots: usize,
        is_obj_array: bool,
    ) -> Option<ObjectReference> {
        let words = slots + 1;
        let start = region.allocate(words)?;
        region
            .block_offset_table()
            .update_for_alloc(region.bottom(), start, start + (words << LOG_BYTES_IN_WORD));
        vm::publish_object(start, words, is_obj_array);
        Some(ObjectReference::from_address(start))
    }

    /// Bumps the allocation frontier without publishing a header, leaving an
    /// unparsable tail behind. Used to exercise the refinement failure path.
    pub fn alloc_unparsable(&self, region: &Region, words: usize) -> Option<Address> {
        region.allocate(words)
    }

    /// Latches every region's `scan_top`; called once when a pause starts.
    pub fn prepare_for_pause(&self) {
        for region in self.regions.iter() {
            region.record_scan_top();
        }
    }

    pub fn add_to_collection_set(&self, region: &Region) {
        debug_assert!(!region.in_collection_set());
        region.set_in_collection_set(true);
        region.rem_set().reset_for_par_iteration();
        self.collection_set.lock().push(region.index());
    }

    pub fn clear_collection_set(&self) {
        let mut cset = self.collection_set.lock();
        for index in cset.drain(..) {
            self.regions[index].set_in_collection_set(false);
        }
    }

    pub fn collection_set(&self) -> Vec<usize> {
        self.collection_set.lock().clone()
    }

    /// Iterates the collection set starting at a worker-biased offset to
    /// spread claim contention.
    pub fn collection_set_iterate_from<F: FnMut(&Region)>(
        &self,
        worker: usize,
        n_workers: usize,
        mut f: F,
    ) {
        let cset = self.collection_set();
        if cset.is_empty() {
            return;
        }
        let start = cset.len() * worker / n_workers.max(1);
        for k in 0..cset.len() {
            f(&self.regions[cset[(start + k) % cset.len()]]);
        }
    }

    /// Records a region whose cards get dirtied or claimed during the pause,
    /// so cleanup can restrict itself to those regions' card ranges.
    pub fn push_dirty_cards_region(&self, region: &Region) {
        if region.try_join_dirty_cards_region_list() {
            self.dirty_cards_regions.lock().push(region.index());
        }
    }

    /// Resets the card bytes (and hotness counts) of every region on the
    /// dirty-cards-region list, then empties the list.
    pub fn cleanup_dirty_cards_regions(&self) {
        let indices: Vec<usize> = self.dirty_cards_regions.lock().drain(..).collect();
        for index in indices {
            let region = &self.regions[index];
            let state = if region.is_young() {
                CardState::Young
            } else {
                CardState::Clean
            };
            self.card_table
                .clear_range(region.bottom(), region.end(), state);
            region.leave_dirty_cards_region_list();
        }
    }

    /// Claims regions in chunks and applies `f` until the closure aborts or
    /// regions run out. Safe to call from several workers with one shared
    /// claimer.
    pub fn heap_region_par_iterate_chunked<F: FnMut(&Region) -> bool>(
        &self,
        claimer: &RegionClaimer,
        mut f: F,
    ) {
        while let Some(range) = claimer.claim() {
            for index in range {
                if f(&self.regions[index]) {
                    return;
                }
            }
        }
    }
}

/// Hands out disjoint chunks of region indices to parallel workers.
pub struct RegionClaimer {
    cursor: AtomicUsize,
    total: usize,
    chunk: usize,
}

impl RegionClaimer {
    pub fn new(total: usize, chunk: usize) -> Self {
        debug_assert!(chunk >= 1);
        RegionClaimer {
            cursor: AtomicUsize::new(0),
            total,
            chunk,
        }
    }

    pub fn claim(&self) -> Option<std::ops::Range<usize>> {
        let start = self.cursor.fetch_add(self.chunk, Ordering::SeqCst);
        if start >= self.total {
            return None;
        }
        Some(start..(start + self.chunk).min(self.total))
    }
}
