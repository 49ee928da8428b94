use crate::util::address::{Address, ObjectReference};
use crate::util::bitmap::BitMap;
use crate::util::constants::*;

/// The next-mark bitmap: one bit per heap word. Written by the marking
/// subsystem, consumed here by remembered-set rebuilding (objects below TAMS
/// are live iff marked).
pub struct MarkBitmap {
    base: Address,
    bits: BitMap,
}

impl MarkBitmap {
    pub fn new(base: Address, heap_bytes: usize) -> Self {
        MarkBitmap {
            base,
            bits: BitMap::new(heap_bytes >> LOG_BYTES_IN_WORD),
        }
    }

    #[inline]
    fn bit_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.base);
        (addr - self.base) >> LOG_BYTES_IN_WORD
    }

    /// Marks the object. Returns true if it was not marked before.
    #[inline]
    pub fn mark(&self, object: ObjectReference) -> bool {
        self.bits.set(self.bit_of(object.to_address()))
    }

    #[inline]
    pub fn is_marked(&self, object: ObjectReference) -> bool {
        self.is_marked_addr(object.to_address())
    }

    #[inline]
    pub fn is_marked_addr(&self, addr: Address) -> bool {
        self.bits.get(self.bit_of(addr))
    }

    /// The lowest marked address in `[start, limit)`, or `limit` if there is
    /// none.
    pub fn next_marked_address(&self, start: Address, limit: Address) -> Address {
        if start >= limit {
            return limit;
        }
        match self.bits.next_set_bit(self.bit_of(start), self.bit_of(limit)) {
            Some(bit) => self.base + (bit << LOG_BYTES_IN_WORD),
            None => limit,
        }
    }

    pub fn clear_all(&self) {
        self.bits.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_search() {
        let base = Address::from_usize(0x100_0000);
        let bm = MarkBitmap::new(base, 1 << 16);
        let a = ObjectReference::from_address(base + 64usize);
        let b = ObjectReference::from_address(base + 4096usize);
        assert!(bm.mark(a));
        assert!(!bm.mark(a));
        bm.mark(b);
        assert!(bm.is_marked(a));
        assert_eq!(bm.next_marked_address(base, base + 65536usize), a.to_address());
        assert_eq!(
            bm.next_marked_address(base + 72usize, base + 65536usize),
            b.to_address()
        );
        assert_eq!(
            bm.next_marked_address(base + 72usize, base + 4096usize),
            base + 4096usize
        );
        bm.clear_all();
        assert!(!bm.is_marked(a));
    }
}
