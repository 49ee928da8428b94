#![allow(dead_code)]

use remset_core::heap::RegionalHeap;
use remset_core::policy::region::region::{Region, RegionType};
use remset_core::remset::{CodeRootClosure, OopPushClosure, RemSetEngine};
use remset_core::util::address::{Address, ObjectReference};
use remset_core::util::constants::*;
use remset_core::util::options::Options;

/// Options sized for tests: a small heap, two workers, and the hot card
/// cache off unless a test turns it on.
pub fn small_options() -> Options {
    let mut options = Options::default();
    options.heap_size = 16 * BYTES_IN_MBYTE;
    options.parallel_gc_threads = 2;
    options.refinement_threads = 0;
    options.hot_card_cache_size = 0;
    options.dcq_buffer_size = 4;
    options
}

pub fn boot(options: Options) -> (&'static RegionalHeap, &'static RemSetEngine) {
    let _ = remset_core::util::logger::init();
    let heap = RegionalHeap::boot(options).unwrap();
    let engine = RemSetEngine::boot(heap);
    (heap, engine)
}

pub fn boot_small() -> (&'static RegionalHeap, &'static RemSetEngine) {
    boot(small_options())
}

pub fn old_region(heap: &'static RegionalHeap) -> &'static Region {
    heap.alloc_region(RegionType::Old).unwrap()
}

/// The address of the object's i-th reference slot.
pub fn slot_of(object: ObjectReference, i: usize) -> Address {
    object.to_address() + (i + 1) * BYTES_IN_WORD
}

/// Drains the dirty-card queues through concurrent refinement until they are
/// empty, absorbing partial and re-enqueued buffers along the way.
pub fn refine_all(engine: &'static RemSetEngine) {
    loop {
        engine.dcqs().concatenate_logs();
        match engine.dcqs().pop_completed_buffer() {
            None => break,
            Some(buffer) => {
                for card in &buffer {
                    engine.refine_card_concurrently(*card, 0);
                }
                engine.dcqs().recycle(buffer);
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingPush {
    pub refs: Vec<(Address, ObjectReference)>,
    pub trims: usize,
}

impl OopPushClosure for RecordingPush {
    fn do_oop(&mut self, slot: Address, target: ObjectReference) {
        self.refs.push((slot, target));
    }

    fn trim_queue_partially(&mut self) {
        self.trims += 1;
    }
}

impl RecordingPush {
    /// The recorded references whose target lies in the collection set.
    pub fn cset_refs(&self, heap: &RegionalHeap) -> Vec<(Address, ObjectReference)> {
        self.refs
            .iter()
            .copied()
            .filter(|(_, target)| heap.region_of(target.to_address()).in_collection_set())
            .collect()
    }
}

#[derive(Default)]
pub struct RecordingCodeRoots {
    pub roots: Vec<Address>,
}

impl CodeRootClosure for RecordingCodeRoots {
    fn do_code_root(&mut self, root: Address) {
        self.roots.push(root);
    }
}
