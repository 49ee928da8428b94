//! The object model the engine parses cards against.
//!
//! An object is one header word followed by `size - 1` reference slots. The
//! header encodes the object's size in words and whether it is an object
//! array; a zero header marks an unparsable tail, i.e. space whose allocation
//! has been published (the region's `top` covers it) but whose header has
//! not. Concurrent card refinement can observe such tails and must report
//! iteration failure; during a pause `scan_top` never exposes them.
//!
//! Reference slots hold the address of a target object's header, or zero for
//! null. Slots are read and written through atomics so mutators and scanners
//! can race on them without undefined behavior.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::address::{Address, ObjectReference};
use crate::util::constants::*;

const SIZE_MASK: usize = (1 << 48) - 1;
const OBJ_ARRAY_BIT: usize = 1 << 62;

/// The smallest object: a header and one slot.
pub const MIN_OBJECT_WORDS: usize = 2;

#[inline]
fn header_cell(addr: Address) -> &'static AtomicUsize {
    unsafe { &*addr.to_ptr::<AtomicUsize>() }
}

/// Writes the header, publishing the object for concurrent parsers.
pub fn publish_object(start: Address, size_words: usize, is_obj_array: bool) {
    debug_assert!(size_words >= MIN_OBJECT_WORDS && size_words <= SIZE_MASK);
    debug_assert!(start.is_aligned_to(BYTES_IN_WORD));
    let header = size_words | if is_obj_array { OBJ_ARRAY_BIT } else { 0 };
    header_cell(start).store(header, Ordering::Release);
}

/// Is the header at `addr` published? A false return means the space is an
/// unparsable tail of an in-progress allocation.
#[inline]
pub fn is_published(addr: Address) -> bool {
    header_cell(addr).load(Ordering::Acquire) != 0
}

#[inline]
fn header_of(object: ObjectReference) -> usize {
    header_cell(object.to_address()).load(Ordering::Acquire)
}

/// The object's size in words, including the header.
#[inline]
pub fn object_size(object: ObjectReference) -> usize {
    let header = header_of(object);
    debug_assert!(header != 0, "unpublished object at {}", object);
    header & SIZE_MASK
}

#[inline]
pub fn is_obj_array(object: ObjectReference) -> bool {
    header_of(object) & OBJ_ARRAY_BIT != 0
}

/// The first address past the object.
#[inline]
pub fn object_end(object: ObjectReference) -> Address {
    object.to_address() + (object_size(object) << LOG_BYTES_IN_WORD)
}

#[inline]
fn slot_cell(slot: Address) -> &'static AtomicUsize {
    unsafe { &*slot.to_ptr::<AtomicUsize>() }
}

#[inline]
pub fn read_ref_slot(slot: Address) -> ObjectReference {
    ObjectReference::from_address(Address::from_usize(slot_cell(slot).load(Ordering::Acquire)))
}

#[inline]
pub fn store_ref_slot(slot: Address, value: ObjectReference) {
    slot_cell(slot).store(value.to_address().as_usize(), Ordering::Release);
}

/// Applies `f` to every reference slot of the object.
#[inline]
pub fn scan_object<F: FnMut(Address)>(object: ObjectReference, f: &mut F) {
    let mut slot = object.to_address() + BYTES_IN_WORD;
    let end = object_end(object);
    while slot < end {
        f(slot);
        slot += BYTES_IN_WORD;
    }
}

/// Applies `f` to the reference slots of the object whose address lies in
/// `[from, to)`. Used for object arrays crossing card or chunk boundaries.
#[inline]
pub fn scan_object_in<F: FnMut(Address)>(
    object: ObjectReference,
    from: Address,
    to: Address,
    f: &mut F,
) {
    let first = object.to_address() + BYTES_IN_WORD;
    let end = object_end(object);
    let mut slot = first.max(from.align_up(BYTES_IN_WORD));
    let limit = end.min(to);
    while slot < limit {
        f(slot);
        slot += BYTES_IN_WORD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(words: usize) -> Address {
        let mem: Box<[usize]> = vec![0usize; words].into_boxed_slice();
        Address::from_ptr(Box::leak(mem).as_ptr())
    }

    #[test]
    fn publish_and_parse() {
        let start = scratch(8);
        assert!(!is_published(start));
        publish_object(start, 4, false);
        let object = ObjectReference::from_address(start);
        assert!(is_published(start));
        assert_eq!(object_size(object), 4);
        assert!(!is_obj_array(object));
        assert_eq!(object_end(object), start + 4 * BYTES_IN_WORD);
    }

    #[test]
    fn slot_iteration() {
        let start = scratch(8);
        publish_object(start, 5, true);
        let object = ObjectReference::from_address(start);
        let mut slots = vec![];
        scan_object(object, &mut |s| slots.push(s));
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[0], start + BYTES_IN_WORD);

        let mut window = vec![];
        scan_object_in(
            object,
            start + 2 * BYTES_IN_WORD,
            start + 4 * BYTES_IN_WORD,
            &mut |s| window.push(s),
        );
        assert_eq!(
            window,
            vec![start + 2 * BYTES_IN_WORD, start + 3 * BYTES_IN_WORD]
        );
    }

    #[test]
    fn slot_read_write() {
        let start = scratch(4);
        publish_object(start, 2, false);
        let slot = start + BYTES_IN_WORD;
        assert!(read_ref_slot(slot).is_null());
        let target = ObjectReference::from_address(start + 2 * BYTES_IN_WORD);
        store_ref_slot(slot, target);
        assert_eq!(read_ref_slot(slot), target);
    }
}
