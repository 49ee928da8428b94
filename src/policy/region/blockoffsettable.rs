use atomic::{Atomic, Ordering};

use super::card::*;
use super::region::CARDS_IN_REGION;
use crate::util::address::Address;

/// Per-region card-indexed table recording, for each card, the start address
/// of the object covering the card's first word. Maintained eagerly by the
/// allocation paths; a zero entry means the card's first word is not covered
/// by any published allocation yet, which concurrent refinement treats as an
/// unparsable tail.
pub struct BlockOffsetTable {
    table: Box<[Atomic<Address>]>,
}

impl BlockOffsetTable {
    pub fn new() -> Self {
        BlockOffsetTable {
            table: (0..CARDS_IN_REGION).map(|_| Atomic::new(Address::ZERO)).collect(),
        }
    }

    #[inline]
    fn index(&self, region_bottom: Address, card: Card) -> usize {
        debug_assert!(card.start() >= region_bottom);
        let index = (card.start() - region_bottom) >> LOG_BYTES_IN_CARD;
        debug_assert!(index < self.table.len());
        index
    }

    /// Records a new allocation `[start, end)`: every card whose first word
    /// the allocation covers maps back to `start`. The range is clamped to
    /// this region, so a humongous allocation invokes this once per spanned
    /// region with the same object bounds.
    pub fn update_for_alloc(&self, region_bottom: Address, start: Address, end: Address) {
        let mut boundary = if start <= region_bottom {
            region_bottom
        } else {
            let aligned = Card::align(start);
            if aligned < start {
                aligned + BYTES_IN_CARD
            } else {
                aligned
            }
        };
        let limit = end.min(region_bottom + super::region::BYTES_IN_REGION);
        while boundary < limit {
            let index = self.index(region_bottom, Card::from_aligned(boundary));
            self.table[index].store(start, Ordering::Release);
            boundary += BYTES_IN_CARD;
        }
    }

    /// The start of the object extending into the card, or None if the
    /// card's first word is not yet covered by a published allocation.
    #[inline]
    pub fn block_start(&self, region_bottom: Address, card: Card) -> Option<Address> {
        let start = self.table[self.index(region_bottom, card)].load(Ordering::Acquire);
        if start.is_zero() {
            None
        } else {
            debug_assert!(start <= card.start());
            Some(start)
        }
    }

    pub fn clear(&self) {
        for entry in self.table.iter() {
            entry.store(Address::ZERO, Ordering::Relaxed);
        }
    }
}

impl Default for BlockOffsetTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_spanned_cards() {
        let bot = BlockOffsetTable::new();
        let bottom = Address::from_usize(0x40_0000);
        // An object from bottom+8 spanning three cards.
        let start = bottom + 8usize;
        let end = bottom + 2 * BYTES_IN_CARD + 64usize;
        bot.update_for_alloc(bottom, start, end);

        // First card's first word is below the object start: unset.
        assert_eq!(bot.block_start(bottom, Card::of(bottom)), None);
        let c1 = Card::of(bottom + BYTES_IN_CARD);
        let c2 = Card::of(bottom + 2 * BYTES_IN_CARD);
        assert_eq!(bot.block_start(bottom, c1), Some(start));
        assert_eq!(bot.block_start(bottom, c2), Some(start));

        // An object starting exactly at a card boundary owns that card.
        let next = bottom + 3 * BYTES_IN_CARD;
        bot.update_for_alloc(bottom, next, next + 16usize);
        assert_eq!(bot.block_start(bottom, Card::of(next)), Some(next));

        bot.clear();
        assert_eq!(bot.block_start(bottom, c1), None);
    }
}
