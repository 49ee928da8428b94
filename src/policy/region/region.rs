use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use super::blockoffsettable::BlockOffsetTable;
use super::card::*;
use super::remset::RemSet;
use crate::util::address::{Address, ObjectReference};
use crate::util::constants::*;
use crate::vm;

pub const LOG_BYTES_IN_REGION: usize = 20;
pub const BYTES_IN_REGION: usize = 1 << LOG_BYTES_IN_REGION;
pub const REGION_MASK: usize = BYTES_IN_REGION - 1;
pub const CARDS_IN_REGION: usize = BYTES_IN_REGION >> LOG_BYTES_IN_CARD;
pub const WORDS_IN_REGION: usize = BYTES_IN_REGION >> LOG_BYTES_IN_WORD;

/// The lifecycle type of a region. Stored as an atomic byte: the allocator
/// store-releases it at region (re)birth and concurrent refinement
/// load-acquires it, so an observed old/humongous type is consistent with a
/// non-stale card.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, NoUninit)]
pub enum RegionType {
    Free = 0,
    Young = 1,
    Old = 2,
    HumongousStart = 3,
    HumongousCont = 4,
}

/// Metadata of one fixed-size heap region. Instances live in the heap's
/// leaked side table and are handed out as `&'static Region`.
pub struct Region {
    index: usize,
    bottom: Address,
    end: Address,
    typ: Atomic<RegionType>,
    top: Atomic<Address>,
    scan_top: Atomic<Address>,
    in_cset: AtomicBool,
    /// Top at mark start: everything at or above is implicitly live for the
    /// current marking cycle.
    tams: Atomic<Address>,
    next_marked_bytes: AtomicUsize,
    rem_set: RemSet,
    bot: BlockOffsetTable,
    code_roots: spin::Mutex<Vec<Address>>,
    on_dirty_cards_list: AtomicBool,
    /// For humongous start and continuation regions, the address of the
    /// humongous object.
    humongous_obj: Atomic<Address>,
}

impl Region {
    pub fn new(index: usize, bottom: Address, heap_base: Address, regions_in_heap: usize) -> Self {
        Region {
            index,
            bottom,
            end: bottom + BYTES_IN_REGION,
            typ: Atomic::new(RegionType::Free),
            top: Atomic::new(bottom),
            scan_top: Atomic::new(bottom),
            in_cset: AtomicBool::new(false),
            tams: Atomic::new(bottom),
            next_marked_bytes: AtomicUsize::new(0),
            rem_set: RemSet::new(heap_base, regions_in_heap),
            bot: BlockOffsetTable::new(),
            code_roots: spin::Mutex::new(vec![]),
            on_dirty_cards_list: AtomicBool::new(false),
            humongous_obj: Atomic::new(Address::ZERO),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn bottom(&self) -> Address {
        self.bottom
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline]
    pub fn typ(&self) -> RegionType {
        self.typ.load(Ordering::Acquire)
    }

    /// Publishes the region's type; release-store pairing with the acquire
    /// load in the refinement relevance checks.
    pub fn set_type(&self, typ: RegionType) {
        self.typ.store(typ, Ordering::Release);
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.typ() == RegionType::Free
    }

    #[inline]
    pub fn is_young(&self) -> bool {
        self.typ() == RegionType::Young
    }

    #[inline]
    pub fn is_old_or_humongous(&self) -> bool {
        matches!(
            self.typ(),
            RegionType::Old | RegionType::HumongousStart | RegionType::HumongousCont
        )
    }

    #[inline]
    pub fn is_humongous(&self) -> bool {
        matches!(
            self.typ(),
            RegionType::HumongousStart | RegionType::HumongousCont
        )
    }

    #[inline]
    pub fn is_humongous_cont(&self) -> bool {
        self.typ() == RegionType::HumongousCont
    }

    /// The allocation frontier. Humongous allocation publishes top last, so
    /// this is an acquire load ordered against the refiner's fence.
    #[inline]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Acquire)
    }

    pub fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    /// The upper bound of parsable memory during an STW pause, excluding
    /// GC-lab tails.
    #[inline]
    pub fn scan_top(&self) -> Address {
        self.scan_top.load(Ordering::Relaxed)
    }

    /// Latches `top` into `scan_top`; called once per region when a pause
    /// starts.
    pub fn record_scan_top(&self) {
        self.scan_top.store(self.top(), Ordering::Relaxed);
    }

    #[inline]
    pub fn in_collection_set(&self) -> bool {
        self.in_cset.load(Ordering::Relaxed)
    }

    pub fn set_in_collection_set(&self, in_cset: bool) {
        self.in_cset.store(in_cset, Ordering::Relaxed);
    }

    #[inline]
    pub fn next_top_at_mark_start(&self) -> Address {
        self.tams.load(Ordering::Relaxed)
    }

    pub fn set_next_top_at_mark_start(&self, tams: Address) {
        debug_assert!(tams >= self.bottom && tams <= self.end);
        self.tams.store(tams, Ordering::Relaxed);
    }

    #[inline]
    pub fn next_marked_bytes(&self) -> usize {
        self.next_marked_bytes.load(Ordering::Relaxed)
    }

    pub fn add_next_marked_bytes(&self, bytes: usize) {
        self.next_marked_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset_next_marked_bytes(&self) {
        self.next_marked_bytes.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn rem_set(&self) -> &RemSet {
        &self.rem_set
    }

    #[inline]
    pub fn block_offset_table(&self) -> &BlockOffsetTable {
        &self.bot
    }

    pub fn humongous_obj(&self) -> ObjectReference {
        ObjectReference::from_address(self.humongous_obj.load(Ordering::Acquire))
    }

    pub fn set_humongous_obj(&self, obj: ObjectReference) {
        self.humongous_obj.store(obj.to_address(), Ordering::Release);
    }

    /// Bump allocation within the region. Returns the start of the allocated
    /// range, which is unparsable until the caller publishes a header.
    pub fn allocate(&self, words: usize) -> Option<Address> {
        let bytes = words << LOG_BYTES_IN_WORD;
        loop {
            let old = self.top.load(Ordering::Relaxed);
            let new = old + bytes;
            if new > self.end {
                return None;
            }
            if self
                .top
                .compare_exchange(old, new, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Some(old);
            }
        }
    }

    pub fn add_strong_code_root(&self, root: Address) {
        self.code_roots.lock().push(root);
    }

    pub fn strong_code_roots_do<F: FnMut(Address)>(&self, f: &mut F) {
        for root in self.code_roots.lock().iter() {
            f(*root);
        }
    }

    pub fn is_on_dirty_cards_region_list(&self) -> bool {
        self.on_dirty_cards_list.load(Ordering::Relaxed)
    }

    /// Atomically joins the dirty-cards-region list. Returns false if the
    /// region was already on it.
    pub fn try_join_dirty_cards_region_list(&self) -> bool {
        !self.on_dirty_cards_list.swap(true, Ordering::Relaxed)
    }

    pub fn leave_dirty_cards_region_list(&self) {
        self.on_dirty_cards_list.store(false, Ordering::Relaxed);
    }

    /// Resets all metadata for reallocation. The caller publishes the new
    /// type afterwards.
    pub fn reset(&self) {
        self.top.store(self.bottom, Ordering::Relaxed);
        self.scan_top.store(self.bottom, Ordering::Relaxed);
        self.tams.store(self.bottom, Ordering::Relaxed);
        self.in_cset.store(false, Ordering::Relaxed);
        self.next_marked_bytes.store(0, Ordering::Relaxed);
        self.rem_set.clear();
        self.bot.clear();
        self.code_roots.lock().clear();
        self.on_dirty_cards_list.store(false, Ordering::Relaxed);
        self.humongous_obj.store(Address::ZERO, Ordering::Relaxed);
    }

    /// Walks the objects intersecting `[start, end)`, applying `f` to their
    /// reference slots. Object arrays and objects crossing `end` are filtered
    /// to the range; other objects are scanned whole. Returns false if an
    /// unparsable tail (unpublished header or missing block-offset entry) was
    /// encountered, which can only happen concurrently.
    pub fn oops_on_card_iterate_careful<F: FnMut(Address)>(
        &self,
        start: Address,
        end: Address,
        f: &mut F,
    ) -> bool {
        debug_assert!(start < end);
        debug_assert!(start >= self.bottom && end <= self.end);
        let mut cursor = match self.bot.block_start(self.bottom, Card::of(start)) {
            Some(a) => a,
            None => return false,
        };
        while cursor < end {
            if !vm::is_published(cursor) {
                return false;
            }
            let obj = ObjectReference::from_address(cursor);
            let obj_end = vm::object_end(obj);
            if obj_end > start {
                if obj_end > end || vm::is_obj_array(obj) {
                    vm::scan_object_in(obj, start, end, f);
                } else {
                    vm::scan_object(obj, f);
                }
            }
            cursor = obj_end;
        }
        true
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "region {} [{:?}, {:?}) {:?}",
            self.index,
            self.bottom,
            self.end,
            self.typ.load(Ordering::Relaxed)
        )
    }
}
