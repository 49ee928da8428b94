use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use super::card::*;
use super::cardtable::CardTable;
use super::region::{CARDS_IN_REGION, LOG_BYTES_IN_REGION, REGION_MASK};
use crate::util::address::Address;
use crate::util::bitmap::BitMap;
use crate::util::constants::*;

const ITER_UNCLAIMED: u8 = 0;
const ITER_CLAIMED: u8 = 1;
const ITER_COMPLETE: u8 = 2;

/// The remembered set of one region: the set of cards in *other* regions
/// that may contain pointers into it.
///
/// Internally a sparse array of per-from-region card bitmaps, installed
/// lazily with a CAS so any worker (refiner, pause updater, rebuilder) can
/// insert concurrently. Iteration carries a claim protocol for the two-pass
/// parallel collection-set scan: `claim_iter` hands one worker exclusive
/// first-pass ownership, `iter_claimed_next` sub-claims blocks of card ranks
/// for everyone, and `set_iter_complete`/`iter_is_complete` publish
/// completion with release/acquire pairing.
pub struct RemSet {
    heap_base: Address,
    rs_size: AtomicUsize,
    prts: Box<[AtomicPtr<PerRegionTable>]>,
    iter_state: AtomicU8,
    iter_claimed: AtomicUsize,
}

unsafe impl Send for RemSet {}
unsafe impl Sync for RemSet {}

impl RemSet {
    pub fn new(heap_base: Address, regions_in_heap: usize) -> Self {
        RemSet {
            heap_base,
            rs_size: AtomicUsize::new(0),
            prts: (0..regions_in_heap)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            iter_state: AtomicU8::new(ITER_UNCLAIMED),
            iter_claimed: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn from_region_index(&self, card: Card) -> usize {
        let index = (card.start() - self.heap_base) >> LOG_BYTES_IN_REGION;
        debug_assert!(index < self.prts.len());
        index
    }

    fn get_per_region_table(&self, card: Card) -> &PerRegionTable {
        let entry = &self.prts[self.from_region_index(card)];
        let mut ptr = entry.load(Ordering::Acquire);
        if ptr.is_null() {
            let region = Address::from_usize(card.start().as_usize() & !REGION_MASK);
            let new_table = Box::into_raw(Box::new(PerRegionTable::new(region)));
            match entry.compare_exchange(
                std::ptr::null_mut(),
                new_table,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => ptr = new_table,
                Err(winner) => {
                    // Another worker installed a table first; drop ours.
                    let _lost = unsafe { Box::from_raw(new_table) };
                    ptr = winner;
                }
            }
        }
        unsafe { &*ptr }
    }

    /// Thread-safe insert. Set semantics: re-inserting a present card is a
    /// no-op.
    pub fn add_card(&self, card: Card) {
        let prt = self.get_per_region_table(card);
        if prt.add_card(card) {
            self.rs_size.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn contains_card(&self, card: Card) -> bool {
        let entry = &self.prts[self.from_region_index(card)];
        let ptr = entry.load(Ordering::Acquire);
        if ptr.is_null() {
            return false;
        }
        unsafe { &*ptr }.contains_card(card)
    }

    /// The number of remembered cards.
    pub fn occupied(&self) -> usize {
        self.rs_size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    /// Approximate memory footprint in bytes, for summary reporting.
    pub fn mem_size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>() + self.prts.len() * BYTES_IN_WORD;
        for entry in self.prts.iter() {
            if !entry.load(Ordering::Relaxed).is_null() {
                size += std::mem::size_of::<PerRegionTable>() + (CARDS_IN_REGION >> LOG_BITS_IN_BYTE);
            }
        }
        size
    }

    /// Iterates all remembered cards in a stable order (ascending from-region
    /// index, then ascending card), so that card ranks are consistent across
    /// the two scan passes.
    #[inline]
    pub fn iterate<F: FnMut(Card)>(&self, mut f: F) {
        for entry in self.prts.iter() {
            let ptr = entry.load(Ordering::Acquire);
            if !ptr.is_null() {
                unsafe { &*ptr }.iterate(&mut f);
            }
        }
    }

    /// Attempts to become the single first-pass iterator. Pairs with
    /// `set_iter_complete` via release/acquire.
    pub fn claim_iter(&self) -> bool {
        self.iter_state
            .compare_exchange(
                ITER_UNCLAIMED,
                ITER_CLAIMED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Claims the next block of card ranks; returns the rank the block starts
    /// at. Shared by first- and second-pass workers.
    pub fn iter_claimed_next(&self, block_size: usize) -> usize {
        self.iter_claimed.fetch_add(block_size, Ordering::SeqCst)
    }

    pub fn set_iter_complete(&self) {
        self.iter_state.store(ITER_COMPLETE, Ordering::Release);
    }

    pub fn iter_is_complete(&self) -> bool {
        self.iter_state.load(Ordering::Acquire) == ITER_COMPLETE
    }

    /// Rewinds the iteration state; called when the region enters a
    /// collection set.
    pub fn reset_for_par_iteration(&self) {
        self.iter_state.store(ITER_UNCLAIMED, Ordering::Relaxed);
        self.iter_claimed.store(0, Ordering::Relaxed);
    }

    /// Drops entries referring to dead memory: a whole per-from-region table
    /// when `region_bm` says the from-region is dead, individual cards when
    /// `card_bm` says the card holds no live object.
    pub fn scrub(&self, ct: &CardTable, region_bm: &BitMap, card_bm: &BitMap) {
        for (index, entry) in self.prts.iter().enumerate() {
            let ptr = entry.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            if !region_bm.get(index) {
                let dead = entry.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if !dead.is_null() {
                    let table = unsafe { Box::from_raw(dead) };
                    self.rs_size.fetch_sub(table.num_cards(), Ordering::Relaxed);
                }
                continue;
            }
            let table = unsafe { &*ptr };
            let mut removed = 0;
            table.iterate(&mut |card| {
                if !card_bm.get(ct.index_for(card)) && table.remove_card(card) {
                    removed += 1;
                }
            });
            self.rs_size.fetch_sub(removed, Ordering::Relaxed);
        }
    }

    /// Empties the set. Called when the owning region is recycled.
    pub fn clear(&self) {
        for entry in self.prts.iter() {
            let ptr = entry.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                let _table = unsafe { Box::from_raw(ptr) };
            }
        }
        self.rs_size.store(0, Ordering::Relaxed);
        self.reset_for_par_iteration();
    }
}

impl Drop for RemSet {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for RemSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<remset:{}>", self.occupied())
    }
}

/// Card bitmap for one from-region: one bit per card in that region.
struct PerRegionTable {
    region: Address,
    data: Box<[AtomicUsize]>,
}

impl PerRegionTable {
    fn new(region: Address) -> Self {
        PerRegionTable {
            region,
            data: (0..CARDS_IN_REGION / BITS_IN_WORD)
                .map(|_| AtomicUsize::new(0))
                .collect(),
        }
    }

    #[inline]
    fn get_entry(&self, card: Card) -> (&AtomicUsize, usize) {
        debug_assert!(card.start() >= self.region);
        let index = (card.start() - self.region) >> LOG_BYTES_IN_CARD;
        debug_assert!(index < CARDS_IN_REGION);
        (&self.data[index >> LOG_BITS_IN_WORD], index & (BITS_IN_WORD - 1))
    }

    fn add_card(&self, card: Card) -> bool {
        let (entry, offset) = self.get_entry(card);
        let old = entry.fetch_or(1 << offset, Ordering::SeqCst);
        old & (1 << offset) == 0
    }

    fn remove_card(&self, card: Card) -> bool {
        let (entry, offset) = self.get_entry(card);
        let old = entry.fetch_and(!(1 << offset), Ordering::SeqCst);
        old & (1 << offset) != 0
    }

    fn contains_card(&self, card: Card) -> bool {
        let (entry, offset) = self.get_entry(card);
        entry.load(Ordering::SeqCst) & (1 << offset) != 0
    }

    fn num_cards(&self) -> usize {
        self.data
            .iter()
            .map(|w| w.load(Ordering::SeqCst).count_ones() as usize)
            .sum()
    }

    #[inline]
    fn iterate<F: FnMut(Card)>(&self, f: &mut F) {
        for i in 0..self.data.len() {
            let word = self.data[i].load(Ordering::SeqCst);
            if word != 0 {
                for j in 0..BITS_IN_WORD {
                    if word & (1 << j) != 0 {
                        let index = (i << LOG_BITS_IN_WORD) + j;
                        debug_assert!(index < CARDS_IN_REGION);
                        f(Card::from_aligned(self.region + (index << LOG_BYTES_IN_CARD)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x4000_0000;

    fn remset() -> RemSet {
        RemSet::new(Address::from_usize(BASE), 8)
    }

    fn card(region: usize, index: usize) -> Card {
        Card::from_aligned(Address::from_usize(
            BASE + (region << LOG_BYTES_IN_REGION) + (index << LOG_BYTES_IN_CARD),
        ))
    }

    #[test]
    fn add_iterate_ordered() {
        let rs = remset();
        rs.add_card(card(3, 7));
        rs.add_card(card(1, 9));
        rs.add_card(card(3, 7));
        rs.add_card(card(1, 2));
        assert_eq!(rs.occupied(), 3);
        assert!(rs.contains_card(card(3, 7)));
        assert!(!rs.contains_card(card(3, 8)));

        let mut seen = vec![];
        rs.iterate(|c| seen.push(c));
        assert_eq!(seen, vec![card(1, 2), card(1, 9), card(3, 7)]);
    }

    #[test]
    fn claim_protocol() {
        let rs = remset();
        assert!(rs.claim_iter());
        assert!(!rs.claim_iter());
        assert_eq!(rs.iter_claimed_next(4), 0);
        assert_eq!(rs.iter_claimed_next(4), 4);
        assert!(!rs.iter_is_complete());
        rs.set_iter_complete();
        assert!(rs.iter_is_complete());
        rs.reset_for_par_iteration();
        assert!(rs.claim_iter());
        assert_eq!(rs.iter_claimed_next(4), 0);
    }

    #[test]
    fn scrub_drops_dead_entries() {
        let rs = remset();
        let ct = CardTable::new(
            Address::from_usize(BASE),
            8 << LOG_BYTES_IN_REGION,
            4,
        );
        let region_bm = BitMap::new(8);
        let card_bm = BitMap::new(ct.num_cards());

        rs.add_card(card(1, 2)); // live region, live card
        rs.add_card(card(1, 3)); // live region, dead card
        rs.add_card(card(2, 0)); // dead region
        region_bm.set(1);
        card_bm.set(ct.index_for(card(1, 2)));

        rs.scrub(&ct, &region_bm, &card_bm);
        assert_eq!(rs.occupied(), 1);
        assert!(rs.contains_card(card(1, 2)));
        assert!(!rs.contains_card(card(1, 3)));
        assert!(!rs.contains_card(card(2, 0)));
    }

    #[test]
    fn clear_empties() {
        let rs = remset();
        rs.add_card(card(0, 1));
        rs.claim_iter();
        rs.clear();
        assert!(rs.is_empty());
        assert!(rs.claim_iter());
    }
}
