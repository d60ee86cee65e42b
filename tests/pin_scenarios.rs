//! # Pin and Map Scenario Tests
//!
//! End-to-end tests of the pin/map/unpin surface through the public engine
//! API, against an in-memory mapper.
//!
//! ## Test Philosophy
//!
//! All tests follow specification-first design: expected buffer shapes,
//! overlay spans and eviction outcomes are computed from the documented
//! behavior, not from running the code. Each test verifies observable
//! behavior only — handle shape, buffer offsets, pool partition counts and
//! backing-store contents.
//!
//! ## Requirements Tested
//!
//! - R1: Disjoint pins produce one buffer each, kept in descending order
//! - R2: A pin crossing buffer boundaries returns an overlay handle whose
//!       unpin fans out to every member
//! - R3: The view pool evicts only least-recently-used idle views; pinned
//!       views are never evicted
//! - R4: Non-blocking pins that cannot proceed unwind completely
//! - R5: Data written through a pin reads back through later pins and maps

use std::sync::Arc;

use viewcache::{
    CacheEngine, CacheOptions, HeapMapper, PinFlags, StreamSizes, UnpinAction, ViewMapper,
};

const PAGE: u64 = 4096;
const WINDOW: u64 = 256 * 1024;

fn engine_with_pool(capacity: usize) -> (Arc<HeapMapper>, CacheEngine) {
    let mapper = Arc::new(HeapMapper::new());
    let engine = CacheEngine::new(
        Arc::clone(&mapper) as Arc<dyn ViewMapper>,
        CacheOptions {
            pool_capacity: capacity,
            dirty_threshold_pages: Some(1 << 20),
        },
    );
    (mapper, engine)
}

#[test]
fn three_disjoint_read_pins_make_three_buffers_in_descending_order() {
    let (_, engine) = engine_with_pool(8);
    engine
        .initialize_stream(1, StreamSizes::exact(10 << 20), false, None, None)
        .unwrap();

    // Three disjoint 64 KiB ranges, pinned out of order.
    let ranges = [(4 << 20, 64 * 1024), (0, 64 * 1024), (8 << 20, 64 * 1024)];
    let mut pins = Vec::new();
    for &(offset, len) in &ranges {
        let pin = engine
            .pin_for_read(1, offset, len, PinFlags::blocking())
            .unwrap()
            .unwrap();
        assert!(!pin.is_overlay(), "disjoint 64 KiB pin needs no overlay");
        assert_eq!(pin.buffer_count(), 1);
        pins.push(pin);
    }

    assert_eq!(
        engine.cached_buffer_offsets(1),
        vec![8 << 20, 4 << 20, 0],
        "buffers are kept in descending offset order"
    );

    for pin in pins {
        engine.unpin(pin, UnpinAction::Unpin).unwrap();
    }
    // Clean unreferenced buffers are destroyed on unpin.
    assert!(engine.cached_buffer_offsets(1).is_empty());
}

#[test]
fn overlapping_write_pins_return_an_overlay_spanning_two_buffers() {
    let (_, engine) = engine_with_pool(8);
    engine
        .initialize_stream(1, StreamSizes::exact(10 << 20), false, None, None)
        .unwrap();

    let first = engine
        .prepare_for_write(1, 0, 100_000, PinFlags::blocking(), false)
        .unwrap()
        .unwrap();
    assert_eq!(first.buffer_count(), 1);
    engine.unpin(first, UnpinAction::Unpin).unwrap();

    // Dirty data keeps the buffer alive after unpin, so the second pin
    // reuses it and adds one buffer for the uncovered tail.
    let second = engine
        .prepare_for_write(1, 50_000, 100_000, PinFlags::blocking(), false)
        .unwrap()
        .unwrap();
    assert!(second.is_overlay());
    assert_eq!(second.buffer_count(), 2);
    assert_eq!(engine.cached_buffer_offsets(1).len(), 2);

    engine.unpin(second, UnpinAction::MarkClean).unwrap();
    // The fan-out unpin left no member referenced; clean members die.
    assert!(engine.cached_buffer_offsets(1).is_empty());
    assert_eq!(engine.dirty_totals().global, 0);
}

#[test]
fn pool_evicts_least_recently_used_idle_window() {
    let capacity = 4;
    let (mapper, engine) = engine_with_pool(capacity);
    engine
        .initialize_stream(1, StreamSizes::exact(10 << 20), false, None, None)
        .unwrap();

    // Touch capacity + 1 disjoint unpinned windows.
    for i in 0..=capacity as u64 {
        let pin = engine
            .pin_for_read(1, i * WINDOW, PAGE, PinFlags::blocking())
            .unwrap()
            .unwrap();
        engine.unpin(pin, UnpinAction::Unpin).unwrap();
    }

    // The (N+1)th touch succeeded by reusing the LRU window; the pool never
    // grew past its capacity.
    assert_eq!(mapper.active_windows(), capacity);
    let partition = engine.pool_partition();
    assert_eq!(partition.free + partition.idle + partition.in_use, capacity);
    assert_eq!(partition.idle, capacity);
}

#[test]
fn pinned_views_survive_eviction_pressure() {
    let capacity = 4;
    let (_, engine) = engine_with_pool(capacity);
    engine
        .initialize_stream(1, StreamSizes::exact(10 << 20), false, None, None)
        .unwrap();

    // Write a marker, keep the pin held.
    let held = engine
        .prepare_for_write(1, 0, PAGE, PinFlags::blocking(), false)
        .unwrap()
        .unwrap();
    engine.write_pinned(&held, b"survivor").unwrap();

    // Churn through enough other windows to evict everything idle.
    for round in 0..3u64 {
        for i in 1..capacity as u64 {
            let offset = (round * (capacity as u64 - 1) + i) * WINDOW;
            let pin = engine
                .pin_for_read(1, offset, PAGE, PinFlags::blocking())
                .unwrap()
                .unwrap();
            engine.unpin(pin, UnpinAction::Unpin).unwrap();
        }
    }

    // The held pin's view was never stolen.
    let mut buf = [0u8; 8];
    engine.read_pinned(&held, &mut buf).unwrap();
    assert_eq!(&buf, b"survivor");
    engine.unpin(held, UnpinAction::MarkClean).unwrap();
}

#[test]
fn exhausted_pool_with_all_views_pinned_fails_cleanly() {
    let (_, engine) = engine_with_pool(2);
    engine
        .initialize_stream(1, StreamSizes::exact(10 << 20), false, None, None)
        .unwrap();

    let a = engine
        .pin_for_read(1, 0, PAGE, PinFlags::blocking())
        .unwrap()
        .unwrap();
    let b = engine
        .pin_for_read(1, WINDOW, PAGE, PinFlags::blocking())
        .unwrap()
        .unwrap();

    let err = engine
        .pin_for_read(1, 2 * WINDOW, PAGE, PinFlags::blocking())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<viewcache::CacheError>(),
        Some(viewcache::CacheError::ResourceExhausted { .. })
    ));

    // The failed pin unwound: accounting and buffers are untouched.
    assert_eq!(engine.cached_buffer_offsets(1).len(), 2);
    assert_eq!(engine.dirty_totals().global, 0);

    engine.unpin(a, UnpinAction::Unpin).unwrap();
    engine.unpin(b, UnpinAction::Unpin).unwrap();
}

#[test]
fn nonblocking_pin_unwinds_on_admission_conflict() {
    let (_, engine) = engine_with_pool(8);
    engine
        .initialize_stream(1, StreamSizes::exact(10 << 20), false, None, None)
        .unwrap();

    let writer = engine
        .prepare_for_write(1, 0, PAGE, PinFlags::blocking(), false)
        .unwrap()
        .unwrap();

    // A non-blocking overlapping pin reports would-block instead of
    // waiting, and leaves no trace of the buffers it briefly created.
    let before = engine.cached_buffer_offsets(1);
    let refused = engine
        .pin_for_read(1, 0, 4 * PAGE, PinFlags::nonblocking())
        .unwrap();
    assert!(refused.is_none());
    assert_eq!(engine.cached_buffer_offsets(1), before);

    engine.unpin(writer, UnpinAction::MarkClean).unwrap();

    // With the writer gone the same pin succeeds.
    let pin = engine
        .pin_for_read(1, 0, 4 * PAGE, PinFlags::nonblocking())
        .unwrap()
        .unwrap();
    engine.unpin(pin, UnpinAction::Unpin).unwrap();
}

#[test]
fn concurrent_readers_share_a_buffer_writer_excludes() {
    let (_, engine) = engine_with_pool(8);
    engine
        .initialize_stream(1, StreamSizes::exact(1 << 20), false, None, None)
        .unwrap();

    let r1 = engine
        .pin_for_read(1, 0, PAGE, PinFlags::blocking())
        .unwrap()
        .unwrap();
    let r2 = engine
        .pin_for_read(1, 0, PAGE, PinFlags::blocking())
        .unwrap()
        .unwrap();
    assert_eq!(engine.cached_buffer_offsets(1).len(), 1, "readers share");

    let refused = engine
        .prepare_for_write(1, 0, PAGE, PinFlags::nonblocking(), false)
        .unwrap();
    assert!(refused.is_none(), "writer excluded while readers hold");

    engine.unpin(r1, UnpinAction::Unpin).unwrap();
    engine.unpin(r2, UnpinAction::Unpin).unwrap();

    let w = engine
        .prepare_for_write(1, 0, PAGE, PinFlags::nonblocking(), false)
        .unwrap()
        .unwrap();
    engine.unpin(w, UnpinAction::MarkClean).unwrap();
}

#[test]
fn written_data_reads_back_through_maps_and_pins() {
    let (_, engine) = engine_with_pool(8);
    engine
        .initialize_stream(1, StreamSizes::exact(1 << 20), false, None, None)
        .unwrap();

    let w = engine
        .prepare_for_write(1, 123 * PAGE, 64, PinFlags::blocking(), false)
        .unwrap()
        .unwrap();
    engine.write_pinned(&w, b"through the window").unwrap();
    engine.unpin(w, UnpinAction::MarkClean).unwrap();

    let map = engine
        .map_for_read(1, 123 * PAGE, 64, PinFlags::blocking())
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 18];
    engine.read_pinned(&map, &mut buf).unwrap();
    assert_eq!(&buf, b"through the window");
    engine.unpin(map, UnpinAction::Unreference).unwrap();
}

#[test]
fn sequential_flag_bounds_the_working_set() {
    let capacity = 8;
    let (mapper, engine) = engine_with_pool(capacity);
    engine
        .initialize_stream(1, StreamSizes::exact(10 << 20), false, None, None)
        .unwrap();

    // A forward scan with the sequential hint keeps only a couple of
    // windows mapped behind the scan position.
    for i in 0..6u64 {
        let pin = engine
            .pin_for_read(
                1,
                i * WINDOW,
                PAGE,
                PinFlags::blocking().with_sequential(),
            )
            .unwrap()
            .unwrap();
        engine.unpin(pin, UnpinAction::Unpin).unwrap();
    }

    assert!(
        mapper.active_windows() <= 3,
        "release-behind keeps the working set bounded, saw {}",
        mapper.active_windows()
    );
}
