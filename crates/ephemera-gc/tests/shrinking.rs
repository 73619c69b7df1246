//! Ephemeron table growth and shrinking.

#![allow(clippy::cast_possible_wrap)]

use std::cell::Cell;
use std::rc::Rc;

use ephemera_gc::{GcEvent, Heap, Strength, TableStats, Value};

#[test]
fn test_grow_to_128_then_shrink_back_to_32() {
    let mut heap = Heap::new();
    let map = heap.create_weak_collection();
    let map = heap.register_global(map, Strength::Strong, None);

    let after_clearing = Rc::new(Cell::new(None));
    let observed = Rc::clone(&after_clearing);
    heap.add_gc_callback(move |event, heap| {
        if event == GcEvent::WeakCollectionsCleared {
            let collection = heap.global_target(map).unwrap();
            observed.set(Some(heap.table_stats(collection)));
        }
    });

    let collection = heap.global_target(map).unwrap();
    assert_eq!(heap.table_stats(collection).capacity, 32);

    let scope = heap.enter_scope();
    for i in 0..32 {
        let key = heap.allocate(0);
        heap.push_root(key);
        heap.weak_collection_set(collection, key, Value::Int(i));
    }
    assert_eq!(
        heap.table_stats(collection),
        TableStats {
            capacity: 128,
            elements: 32,
            deleted: 0
        }
    );
    heap.leave_scope(scope);

    let metrics = heap.collect_garbage(false);
    assert_eq!(
        after_clearing.get(),
        Some(TableStats {
            capacity: 128,
            elements: 0,
            deleted: 32
        })
    );
    assert_eq!(metrics.ephemeron_entries_cleared, 32);
    assert_eq!(metrics.tables_shrunk, 1);

    let collection = heap.global_target(map).unwrap();
    assert_eq!(
        heap.table_stats(collection),
        TableStats {
            capacity: 32,
            elements: 0,
            deleted: 0
        }
    );
}

#[test]
fn test_partial_death_shrinks_to_fit_survivors() {
    let mut heap = Heap::new();
    let map = heap.create_weak_collection();
    let map = heap.register_global(map, Strength::Strong, None);
    let collection = heap.global_target(map).unwrap();

    let mut survivors = Vec::new();
    let scope = heap.enter_scope();
    for i in 0..32 {
        let key = heap.allocate(0);
        if i < 12 {
            survivors.push(heap.register_global(key, Strength::Strong, None));
        } else {
            heap.push_root(key);
        }
        heap.weak_collection_set(collection, key, Value::Int(i));
    }
    heap.leave_scope(scope);

    heap.collect_garbage(false);
    let collection = heap.global_target(map).unwrap();
    assert_eq!(
        heap.table_stats(collection),
        TableStats {
            capacity: 64,
            elements: 12,
            deleted: 0
        }
    );
    for (i, &handle) in survivors.iter().enumerate() {
        let key = heap.global_target(handle).unwrap();
        assert_eq!(
            heap.weak_collection_get(collection, key),
            Some(Value::Int(i as i64))
        );
    }
}

#[test]
fn test_floor_capacity_keeps_tombstones() {
    let mut heap = Heap::new();
    let map = heap.create_weak_collection();
    let map = heap.register_global(map, Strength::Strong, None);
    let collection = heap.global_target(map).unwrap();

    let scope = heap.enter_scope();
    for i in 0..4 {
        let key = heap.allocate(0);
        heap.push_root(key);
        heap.weak_collection_set(collection, key, Value::Int(i));
    }
    heap.leave_scope(scope);

    let metrics = heap.collect_garbage(false);
    assert_eq!(metrics.tables_shrunk, 0);
    let collection = heap.global_target(map).unwrap();
    assert_eq!(
        heap.table_stats(collection),
        TableStats {
            capacity: 32,
            elements: 0,
            deleted: 4
        }
    );
}

#[test]
fn test_reinsert_after_clearing_stays_at_floor() {
    let mut heap = Heap::new();
    let map = heap.create_weak_collection();
    let map = heap.register_global(map, Strength::Strong, None);
    let collection = heap.global_target(map).unwrap();

    let scope = heap.enter_scope();
    for i in 0..8 {
        let key = heap.allocate(0);
        heap.push_root(key);
        heap.weak_collection_set(collection, key, Value::Int(i));
    }
    heap.leave_scope(scope);
    heap.collect_garbage(false);
    let collection = heap.global_target(map).unwrap();
    assert_eq!(heap.table_stats(collection).deleted, 8);

    let scope = heap.enter_scope();
    for i in 0..8 {
        let key = heap.allocate(0);
        heap.push_root(key);
        heap.weak_collection_set(collection, key, Value::Int(i));
    }
    let stats = heap.table_stats(collection);
    assert_eq!(stats.capacity, 32);
    assert_eq!(stats.elements, 8);
    assert!(stats.elements + stats.deleted <= stats.capacity / 2);
    heap.leave_scope(scope);
}
