use crate::util::address::Address;

pub const LOG_BYTES_IN_CARD: usize = 9;
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;
pub const CARD_MASK: usize = BYTES_IN_CARD - 1;

/// A card: a fixed-size, aligned byte range of the heap covered by one
/// card-table byte. Represented by its start address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Card(Address);

impl Card {
    #[inline]
    pub fn start(self) -> Address {
        self.0
    }

    #[inline]
    pub fn end(self) -> Address {
        self.0 + BYTES_IN_CARD
    }

    #[inline]
    pub fn align(address: Address) -> Address {
        Address::from_usize(address.as_usize() & !CARD_MASK)
    }

    /// The card covering the given address.
    #[inline]
    pub fn of(address: Address) -> Self {
        Card(Self::align(address))
    }

    /// Wraps an already-aligned card start address.
    #[inline]
    pub fn from_aligned(address: Address) -> Self {
        debug_assert!(Self::align(address) == address);
        Card(address)
    }
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "card@{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        let a = Address::from_usize(0x10_0000 + 700);
        let card = Card::of(a);
        assert_eq!(card.start(), Address::from_usize(0x10_0000 + 512));
        assert_eq!(card.end() - card.start(), BYTES_IN_CARD);
        assert_eq!(Card::of(card.start()), card);
    }
}
