//! Remembered-set scrubbing against marking liveness, and chunked,
//! yield-safe rebuilding after a marking cycle.

mod common;

use common::*;
use remset_core::barrier::Mutator;
use remset_core::heap::RegionClaimer;
use remset_core::mark::ConcurrentMarkState;
use remset_core::policy::region::card::Card;
use remset_core::scheduler::WorkGang;
use remset_core::util::bitmap::BitMap;
use remset_core::util::constants::*;

/// Marks the bitmap bit for every non-empty region and for the cards of the
/// given live slots, the shape `scrub` consumes.
fn liveness(
    heap: &'static remset_core::RegionalHeap,
    live_regions: &[usize],
    live_cards: &[Card],
) -> (BitMap, BitMap) {
    let region_bm = BitMap::new(heap.region_count());
    let card_bm = BitMap::new(heap.card_table().num_cards());
    for index in live_regions {
        region_bm.set(*index);
    }
    for card in live_cards {
        card_bm.set(heap.card_table().index_for(*card));
    }
    (region_bm, card_bm)
}

#[test]
fn scrub_removes_only_dead_entries() {
    let (heap, engine) = boot_small();
    let a = old_region(heap);
    let d = old_region(heap);
    let b = old_region(heap);
    let live_src = heap.alloc_object(a, 4, false).unwrap();
    let dead_src = heap.alloc_object(a, 130, false).unwrap(); // separate card
    let doomed_src = heap.alloc_object(d, 4, false).unwrap();
    let target = heap.alloc_object(b, 2, false).unwrap();

    let mutator = Mutator::new(engine);
    mutator.write_ref(slot_of(live_src, 0), target);
    mutator.write_ref(slot_of(dead_src, 100), target);
    mutator.write_ref(slot_of(doomed_src, 0), target);
    mutator.flush();
    refine_all(engine);
    assert_eq!(b.rem_set().occupied(), 3);

    // Region d is entirely dead; in region a only live_src's card stays
    // live.
    let (region_bm, card_bm) = liveness(
        heap,
        &[a.index(), b.index()],
        &[Card::of(slot_of(live_src, 0))],
    );
    engine.scrub(&region_bm, &card_bm);

    assert_eq!(b.rem_set().occupied(), 1);
    assert!(b.rem_set().contains_card(Card::of(slot_of(live_src, 0))));
    assert!(!b.rem_set().contains_card(Card::of(slot_of(dead_src, 100))));
    assert!(!b.rem_set().contains_card(Card::of(slot_of(doomed_src, 0))));
}

#[test]
fn scrub_par_shards_regions_across_workers() {
    let (heap, engine) = boot_small();
    let sources: Vec<_> = (0..4).map(|_| old_region(heap)).collect();
    let b = old_region(heap);
    let target = heap.alloc_object(b, 2, false).unwrap();

    let mutator = Mutator::new(engine);
    for region in &sources {
        let src = heap.alloc_object(region, 4, false).unwrap();
        mutator.write_ref(slot_of(src, 0), target);
    }
    mutator.flush();
    refine_all(engine);
    assert_eq!(b.rem_set().occupied(), 4);

    // Nothing is live: scrubbing empties every remembered set.
    let (region_bm, card_bm) = liveness(heap, &[], &[]);
    let claimer = RegionClaimer::new(heap.region_count(), 2);
    WorkGang::new("scrub").run_task(2, |_| {
        engine.scrub_par(&region_bm, &card_bm, &claimer);
    });
    assert!(b.rem_set().is_empty());
}

/// Builds two old regions with cross references, marks everything live and
/// rebuilds; the result must equal what refinement would have produced.
#[test]
fn rebuild_reconstructs_refined_state() {
    let (heap, engine) = boot_small();
    let a = old_region(heap);
    let b = old_region(heap);
    let a1 = heap.alloc_object(a, 4, false).unwrap();
    let a2 = heap.alloc_object(a, 130, false).unwrap();
    let b1 = heap.alloc_object(b, 4, false).unwrap();

    // Stores without barriers: rebuild must find them on its own.
    remset_core::vm::store_ref_slot(slot_of(a1, 0), b1);
    remset_core::vm::store_ref_slot(slot_of(a2, 100), b1);
    remset_core::vm::store_ref_slot(slot_of(b1, 0), a1);

    // Everything was allocated before marking started.
    a.set_next_top_at_mark_start(a.top());
    b.set_next_top_at_mark_start(b.top());
    let cm = ConcurrentMarkState::new(heap, 2);
    cm.mark_object(a1);
    cm.mark_object(a2);
    cm.mark_object(b1);
    cm.snapshot_rebuild_tops();

    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);

    assert!(b.rem_set().contains_card(Card::of(slot_of(a1, 0))));
    assert!(b.rem_set().contains_card(Card::of(slot_of(a2, 100))));
    assert_eq!(b.rem_set().occupied(), 2);
    assert!(a.rem_set().contains_card(Card::of(slot_of(b1, 0))));
    assert_eq!(a.rem_set().occupied(), 1);
}

/// Dead objects contribute nothing: their references are skipped via the
/// bitmap, and their bytes are not accounted.
#[test]
fn rebuild_skips_unmarked_objects() {
    let (heap, engine) = boot_small();
    let a = old_region(heap);
    let b = old_region(heap);
    let live = heap.alloc_object(a, 4, false).unwrap();
    let dead = heap.alloc_object(a, 130, false).unwrap();
    let b1 = heap.alloc_object(b, 4, false).unwrap();

    remset_core::vm::store_ref_slot(slot_of(live, 0), b1);
    remset_core::vm::store_ref_slot(slot_of(dead, 100), b1);

    a.set_next_top_at_mark_start(a.top());
    b.set_next_top_at_mark_start(b.top());
    let cm = ConcurrentMarkState::new(heap, 1);
    cm.mark_object(live);
    cm.mark_object(b1);
    cm.snapshot_rebuild_tops();

    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);

    assert!(b.rem_set().contains_card(Card::of(slot_of(live, 0))));
    assert!(!b.rem_set().contains_card(Card::of(slot_of(dead, 100))));
}

/// Objects at or above TAMS are live by construction and need no mark bit.
#[test]
fn rebuild_treats_allocations_during_marking_as_live() {
    let (heap, engine) = boot_small();
    let a = old_region(heap);
    let b = old_region(heap);
    let before = heap.alloc_object(a, 4, false).unwrap();
    a.set_next_top_at_mark_start(a.top());
    // Allocated after mark start, below TARS.
    let during = heap.alloc_object(a, 4, false).unwrap();
    let b1 = heap.alloc_object(b, 4, false).unwrap();
    b.set_next_top_at_mark_start(b.bottom());

    remset_core::vm::store_ref_slot(slot_of(during, 0), b1);

    let cm = ConcurrentMarkState::new(heap, 1);
    cm.mark_object(before);
    cm.snapshot_rebuild_tops();
    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);

    assert!(b.rem_set().contains_card(Card::of(slot_of(during, 0))));
}

/// An eagerly reclaimed region (TARS cleared) is skipped outright.
#[test]
fn rebuild_skips_retired_regions() {
    let (heap, engine) = boot_small();
    let a = old_region(heap);
    let b = old_region(heap);
    let src = heap.alloc_object(a, 4, false).unwrap();
    let b1 = heap.alloc_object(b, 4, false).unwrap();
    remset_core::vm::store_ref_slot(slot_of(src, 0), b1);

    a.set_next_top_at_mark_start(a.top());
    b.set_next_top_at_mark_start(b.top());
    let cm = ConcurrentMarkState::new(heap, 1);
    cm.mark_object(src);
    cm.mark_object(b1);
    cm.snapshot_rebuild_tops();
    cm.clear_top_at_rebuild_start(a.index());

    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);

    assert!(b.rem_set().is_empty());
}

/// Concurrent eager reclaim mid-rebuild: whatever the interleaving, rebuild
/// terminates and installs only entries that correspond to real references
/// from the region.
#[test]
fn rebuild_races_with_eager_reclaim() {
    let mut options = small_options();
    options.rebuild_chunk_size = 512;
    let (heap, engine) = boot(options);
    let a = old_region(heap);
    let b = old_region(heap);
    let b1 = heap.alloc_object(b, 4, false).unwrap();

    let mut slots = vec![];
    for _ in 0..512 {
        let src = heap.alloc_object(a, 7, false).unwrap();
        remset_core::vm::store_ref_slot(slot_of(src, 0), b1);
        slots.push(slot_of(src, 0));
    }

    a.set_next_top_at_mark_start(a.bottom());
    b.set_next_top_at_mark_start(b.bottom());
    let cm = ConcurrentMarkState::new(heap, 1);
    cm.snapshot_rebuild_tops();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(std::time::Duration::from_micros(200));
            cm.clear_top_at_rebuild_start(a.index());
        });
        engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);
    });

    // Soundness: every entry present corresponds to an actual reference.
    b.rem_set().iterate(|card| {
        assert!(
            slots.iter().any(|s| Card::of(*s) == card),
            "spurious entry {:?}",
            card
        );
    });
}

/// An object array spanning two rebuild chunks is scanned slice by slice;
/// the union of the slices equals a whole-object traversal.
#[test]
fn obj_array_crossing_chunks_scans_each_slice_once() {
    let mut options = small_options();
    options.rebuild_chunk_size = 512;
    let (heap, engine) = boot(options);
    let a = old_region(heap);
    let b = old_region(heap);

    // 100 slots = 101 words = 808 bytes: crosses the 512-byte chunk line.
    let array = heap.alloc_object(a, 100, true).unwrap();
    let lo = heap.alloc_object(b, 2, false).unwrap();
    let hi = heap.alloc_object(b, 2, false).unwrap();
    remset_core::vm::store_ref_slot(slot_of(array, 3), lo); // first chunk
    remset_core::vm::store_ref_slot(slot_of(array, 90), hi); // second chunk

    a.set_next_top_at_mark_start(a.bottom());
    b.set_next_top_at_mark_start(b.bottom());
    let cm = ConcurrentMarkState::new(heap, 1);
    cm.snapshot_rebuild_tops();
    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);

    assert!(b.rem_set().contains_card(Card::of(slot_of(array, 3))));
    assert!(b.rem_set().contains_card(Card::of(slot_of(array, 90))));
    assert_eq!(b.rem_set().occupied(), 2);
}

#[test]
fn rebuild_handles_humongous_objects() {
    let (heap, engine) = boot_small();
    let b = old_region(heap);
    let b1 = heap.alloc_object(b, 2, false).unwrap();

    // One and a half regions worth of object.
    let words = (BYTES_IN_MBYTE + BYTES_IN_MBYTE / 2) >> LOG_BYTES_IN_WORD;
    let humongous = heap.alloc_humongous(words).unwrap();
    let start_region = heap.region_of(humongous.to_address());
    let cont_region = heap.region(start_region.index() + 1);

    // One reference from each spanned region.
    let lo_slot = slot_of(humongous, 10);
    let hi_slot = slot_of(humongous, (BYTES_IN_MBYTE >> LOG_BYTES_IN_WORD) + 10);
    remset_core::vm::store_ref_slot(lo_slot, b1);
    remset_core::vm::store_ref_slot(hi_slot, b1);
    assert_eq!(heap.region_of(hi_slot).index(), cont_region.index());

    // Allocated before marking and marked live.
    start_region.set_next_top_at_mark_start(start_region.top());
    cont_region.set_next_top_at_mark_start(cont_region.top());
    b.set_next_top_at_mark_start(b.bottom());
    let cm = ConcurrentMarkState::new(heap, 1);
    cm.mark_object(humongous);
    cm.snapshot_rebuild_tops();

    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);

    assert!(b.rem_set().contains_card(Card::of(lo_slot)));
    assert!(b.rem_set().contains_card(Card::of(hi_slot)));
}

#[test]
fn rebuild_skips_dead_humongous_objects() {
    let (heap, engine) = boot_small();
    let b = old_region(heap);
    let b1 = heap.alloc_object(b, 2, false).unwrap();

    let words = BYTES_IN_MBYTE >> LOG_BYTES_IN_WORD;
    let humongous = heap.alloc_humongous(words).unwrap();
    let region = heap.region_of(humongous.to_address());
    remset_core::vm::store_ref_slot(slot_of(humongous, 10), b1);

    // Allocated before marking but never marked: dead.
    region.set_next_top_at_mark_start(region.top());
    b.set_next_top_at_mark_start(b.bottom());
    let cm = ConcurrentMarkState::new(heap, 1);
    cm.snapshot_rebuild_tops();

    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);
    assert!(b.rem_set().is_empty());
}

#[test]
fn rebuild_aborts_on_marking_abort() {
    let (heap, engine) = boot_small();
    let a = old_region(heap);
    let b = old_region(heap);
    let src = heap.alloc_object(a, 4, false).unwrap();
    let b1 = heap.alloc_object(b, 4, false).unwrap();
    remset_core::vm::store_ref_slot(slot_of(src, 0), b1);

    a.set_next_top_at_mark_start(a.bottom());
    b.set_next_top_at_mark_start(b.bottom());
    let cm = ConcurrentMarkState::new(heap, 1);
    cm.snapshot_rebuild_tops();
    cm.set_aborted();

    engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);
    assert!(b.rem_set().is_empty());
}

/// A safepoint request parks rebuild workers at their chunk-boundary yield
/// points; the rebuild finishes correctly once resumed.
#[test]
fn rebuild_yields_to_safepoints() {
    let mut options = small_options();
    options.rebuild_chunk_size = 512;
    let (heap, engine) = boot(options);
    let a = old_region(heap);
    let b = old_region(heap);
    let b1 = heap.alloc_object(b, 4, false).unwrap();
    let mut expected = vec![];
    for _ in 0..256 {
        let src = heap.alloc_object(a, 7, false).unwrap();
        remset_core::vm::store_ref_slot(slot_of(src, 0), b1);
        expected.push(Card::of(slot_of(src, 0)));
    }

    a.set_next_top_at_mark_start(a.bottom());
    b.set_next_top_at_mark_start(b.bottom());
    let cm = ConcurrentMarkState::new(heap, 2);
    cm.snapshot_rebuild_tops();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let sts = cm.suspendible_threads();
            sts.suspend_all();
            std::thread::sleep(std::time::Duration::from_millis(1));
            sts.resume_all();
        });
        engine.rebuild_rem_set(&cm, &WorkGang::new("rebuild"), 0);
    });

    for card in &expected {
        assert!(b.rem_set().contains_card(*card));
    }
}
