use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use std::sync::atomic::AtomicU8;

use super::card::*;
use crate::util::address::Address;

/// The state of one card-table byte.
///
/// `Young` is a distinguishing value installed for young regions so the
/// post-write barrier can filter young-generation stores without looking up
/// the region. `Claimed` is the lazy-claim marker the collection-set scan
/// uses to suppress duplicate card scans.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, NoUninit)]
pub enum CardState {
    Clean = 0,
    Dirty = 1,
    Young = 2,
    Claimed = 3,
}

/// One byte of state plus one hotness count per card, for the whole heap.
///
/// The table itself is lock-free. Racing cleans are resolved by the
/// clean-then-fence idiom in the refinement paths; re-dirtying uses a plain
/// store because dirty is the only legal active value to race towards.
pub struct CardTable {
    base: Address,
    table: Box<[Atomic<CardState>]>,
    hotness: Box<[AtomicU8]>,
    hot_threshold: u8,
}

impl CardTable {
    pub fn new(base: Address, heap_bytes: usize, hot_threshold: u8) -> Self {
        debug_assert!(base.is_aligned_to(BYTES_IN_CARD));
        debug_assert!(heap_bytes % BYTES_IN_CARD == 0);
        let cards = heap_bytes >> LOG_BYTES_IN_CARD;
        CardTable {
            base,
            table: (0..cards).map(|_| Atomic::new(CardState::Clean)).collect(),
            hotness: (0..cards).map(|_| AtomicU8::new(0)).collect(),
            hot_threshold,
        }
    }

    pub fn num_cards(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn index_for(&self, card: Card) -> usize {
        let index = (card.start() - self.base) >> LOG_BYTES_IN_CARD;
        debug_assert!(index < self.table.len());
        index
    }

    #[inline]
    pub fn card_for_index(&self, index: usize) -> Card {
        debug_assert!(index < self.table.len());
        Card::from_aligned(self.base + (index << LOG_BYTES_IN_CARD))
    }

    /// The start address of the card's heap range.
    #[inline]
    pub fn addr_for_index(&self, index: usize) -> Address {
        self.card_for_index(index).start()
    }

    #[inline]
    pub fn get(&self, card: Card) -> CardState {
        self.table[self.index_for(card)].load(Ordering::Relaxed)
    }

    /// Reads the card state with acquire ordering, pairing with the barrier's
    /// release dirtying so that an observed `Dirty` makes the guarded field
    /// store visible.
    #[inline]
    pub fn get_acquire(&self, card: Card) -> CardState {
        self.table[self.index_for(card)].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, card: Card, state: CardState) {
        self.table[self.index_for(card)].store(state, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_release(&self, card: Card, state: CardState) {
        self.table[self.index_for(card)].store(state, Ordering::Release);
    }

    #[inline]
    pub fn is_dirty(&self, card: Card) -> bool {
        self.get_acquire(card) == CardState::Dirty
    }

    #[inline]
    pub fn is_card_claimed(&self, index: usize) -> bool {
        self.table[index].load(Ordering::Relaxed) == CardState::Claimed
    }

    /// Claims the card lazily. Races are benign: several workers may observe
    /// the card unclaimed and all scan it, which is wasteful but correct.
    #[inline]
    pub fn set_card_claimed(&self, index: usize) {
        self.table[index].store(CardState::Claimed, Ordering::Relaxed);
    }

    /// Bumps the card's dirtying count. Returns true once the card has
    /// reached the hot threshold.
    pub fn inc_hotness(&self, card: Card) -> bool {
        let index = self.index_for(card);
        if self.hotness[index].load(Ordering::Relaxed) >= self.hot_threshold {
            return true;
        }
        self.hotness[index].fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Resets the card range `[start, end)` to `state` and zeroes its
    /// hotness counts.
    pub fn clear_range(&self, start: Address, end: Address, state: CardState) {
        debug_assert!(Card::align(start) == start);
        let mut index = self.index_for(Card::of(start));
        let limit = index + ((end - start) >> LOG_BYTES_IN_CARD);
        while index < limit {
            self.table[index].store(state, Ordering::Relaxed);
            self.hotness[index].store(0, Ordering::Relaxed);
            index += 1;
        }
    }

    /// Counts cards in `[start, end)` that are not clean. A verification aid.
    pub fn count_non_clean_in(&self, start: Address, end: Address) -> usize {
        let mut index = self.index_for(Card::of(start));
        let limit = self.index_for(Card::of(end - 1usize)) + 1;
        let mut n = 0;
        while index < limit {
            if self.table[index].load(Ordering::Relaxed) != CardState::Clean {
                n += 1;
            }
            index += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CardTable {
        CardTable::new(Address::from_usize(0x100000), 16 * BYTES_IN_CARD, 2)
    }

    #[test]
    fn states() {
        let ct = table();
        let card = ct.card_for_index(3);
        assert_eq!(ct.get(card), CardState::Clean);
        ct.set(card, CardState::Dirty);
        assert!(ct.is_dirty(card));
        ct.set_card_claimed(3);
        assert!(ct.is_card_claimed(3));
        assert_eq!(ct.index_for(card), 3);
        assert_eq!(ct.addr_for_index(3), card.start());
    }

    #[test]
    fn hotness_threshold() {
        let ct = table();
        let card = ct.card_for_index(0);
        assert!(!ct.inc_hotness(card));
        assert!(!ct.inc_hotness(card));
        assert!(ct.inc_hotness(card));
        assert!(ct.inc_hotness(card));
    }

    #[test]
    fn clear_range_resets_state_and_hotness() {
        let ct = table();
        let start = ct.card_for_index(2).start();
        let end = ct.card_for_index(5).start();
        for i in 2..5 {
            ct.set(ct.card_for_index(i), CardState::Dirty);
            ct.inc_hotness(ct.card_for_index(i));
        }
        assert_eq!(ct.count_non_clean_in(start, end), 3);
        ct.clear_range(start, end, CardState::Clean);
        assert_eq!(ct.count_non_clean_in(start, end), 0);
        assert!(!ct.inc_hotness(ct.card_for_index(2)));
    }
}
