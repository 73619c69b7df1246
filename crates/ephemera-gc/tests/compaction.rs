//! Evacuation and slot updating.

#![allow(clippy::cast_possible_wrap)]

use ephemera_gc::{
    CollectionType, GlobalHandle, Heap, HeapConfig, ObjectRef, Strength, Value,
};

fn small_regions(capacity: usize) -> Heap {
    Heap::with_config(HeapConfig {
        region_capacity: capacity,
        verify_heap: true,
        ..HeapConfig::default()
    })
}

fn target(heap: &Heap, handle: GlobalHandle) -> ObjectRef {
    heap.global_target(handle).expect("strong cell has a target")
}

#[test]
fn test_forced_compaction_moves_every_object() {
    let mut heap = small_regions(4);
    let head = heap.allocate(1);
    let mut tail = head;
    for _ in 0..9 {
        let next = heap.allocate(1);
        heap.set_slot(tail, 0, Value::Object(next));
        tail = next;
    }
    let handle = heap.register_global(head, Strength::Strong, None);
    let before = heap.region_count();

    let metrics = heap.collect_garbage(true);
    assert_eq!(metrics.collection_type, CollectionType::FullCompacting);
    assert_eq!(metrics.objects_relocated, 10);
    assert_eq!(metrics.regions_released, before);
    assert_eq!(metrics.stale_slots, 0);

    let new_head = target(&heap, handle);
    assert_ne!(new_head, head);
    let mut length = 1;
    let mut cursor = new_head;
    while let Value::Object(next) = heap.slot(cursor, 0) {
        assert!(heap.contains(next));
        cursor = next;
        length += 1;
    }
    assert_eq!(length, 10);
}

#[test]
fn test_ephemeron_entries_follow_relocated_keys_and_values() {
    let mut heap = small_regions(4);
    let map = heap.create_weak_collection();
    let map = heap.register_global(map, Strength::Strong, None);

    let mut keys = Vec::new();
    let mut hashes = Vec::new();
    for i in 0..10 {
        let collection = target(&heap, map);
        let key = heap.allocate(0);
        let value = heap.allocate(1);
        heap.set_slot(value, 0, Value::Int(i));
        heap.weak_collection_set(collection, key, Value::Object(value));
        hashes.push(heap.identity_hash(key));
        keys.push(heap.register_global(key, Strength::Strong, None));
    }

    for _ in 0..3 {
        let metrics = heap.collect_garbage(true);
        assert!(metrics.objects_relocated >= 21);

        let collection = target(&heap, map);
        assert_eq!(heap.table_stats(collection).elements, 10);
        for (i, (&key, &hash)) in keys.iter().zip(&hashes).enumerate() {
            let key = target(&heap, key);
            assert_eq!(heap.existing_identity_hash(key), Some(hash));
            let Some(Value::Object(value)) = heap.weak_collection_get(collection, key) else {
                panic!("entry {i} lost its value");
            };
            assert_eq!(heap.slot(value, 0), Value::Int(i as i64));
        }
    }
}

#[test]
fn test_dead_keys_removed_and_survivors_moved_in_one_cycle() {
    let mut heap = small_regions(4);
    let map = heap.create_weak_collection();
    let map = heap.register_global(map, Strength::Strong, None);
    let collection = target(&heap, map);

    let mut live = Vec::new();
    let scope = heap.enter_scope();
    for i in 0..20 {
        let key = heap.allocate(0);
        heap.weak_collection_set(collection, key, Value::Int(i));
        if i % 2 == 0 {
            live.push((heap.register_global(key, Strength::Strong, None), i));
        } else {
            heap.push_root(key);
        }
    }
    heap.leave_scope(scope);

    let metrics = heap.collect_garbage(true);
    assert_eq!(metrics.ephemeron_entries_cleared, 10);

    let collection = target(&heap, map);
    assert_eq!(heap.table_stats(collection).elements, 10);
    for (handle, i) in live {
        let key = target(&heap, handle);
        assert_eq!(heap.weak_collection_get(collection, key), Some(Value::Int(i)));
    }
}

#[test]
fn test_fragmented_regions_are_evacuated() {
    let mut heap = small_regions(8);
    let objects: Vec<_> = (0..32).map(|_| heap.allocate(0)).collect();
    let handles: Vec<_> = [0, 8, 16]
        .iter()
        .map(|&i| heap.register_global(objects[i], Strength::Strong, None))
        .collect();
    assert_eq!(heap.region_count(), 4);

    let first = heap.collect_garbage(false);
    assert_eq!(first.collection_type, CollectionType::Full);
    assert_eq!(first.objects_reclaimed, 29);
    assert_eq!(heap.region_count(), 4);

    let second = heap.collect_garbage(false);
    assert_eq!(second.collection_type, CollectionType::FullCompacting);
    assert_eq!(second.objects_relocated, 3);
    assert_eq!(second.regions_released, 3);
    assert_eq!(second.slots_updated, 3);
    assert_eq!(heap.region_count(), 1);

    let region = heap.region_of(target(&heap, handles[0]));
    for &handle in &handles {
        assert_eq!(heap.region_of(target(&heap, handle)), region);
    }
}

#[test]
fn test_overwritten_slot_is_counted_stale() {
    let mut heap = small_regions(4);
    let a = heap.allocate(1);
    let b = heap.allocate(0);
    let scope = heap.enter_scope();
    heap.push_root(a);

    heap.start_incremental_marking(true);
    assert!(heap.is_evacuation_candidate(heap.region_of(a)));
    heap.mark_step(100);
    heap.set_slot(a, 0, Value::Object(b));
    heap.set_slot(a, 0, Value::Int(1));

    let metrics = heap.collect_garbage(false);
    assert_eq!(metrics.collection_type, CollectionType::IncrementalCompacting);
    // b was shaded by the barrier and survives as floating garbage.
    assert_eq!(metrics.objects_relocated, 2);
    assert_eq!(metrics.slots_updated, 1);
    assert_eq!(metrics.stale_slots, 1);
    heap.leave_scope(scope);
}

#[test]
fn test_barrier_records_store_into_black_allocated_object() {
    let mut heap = small_regions(4);
    let old = heap.allocate(1);
    heap.set_slot(old, 0, Value::Int(7));

    heap.start_incremental_marking(true);
    let fresh = heap.allocate(1);
    assert!(!heap.is_evacuation_candidate(heap.region_of(fresh)));
    let fresh = heap.register_global(fresh, Strength::Strong, None);
    let holder = target(&heap, fresh);
    heap.set_slot(holder, 0, Value::Object(old));

    let metrics = heap.collect_garbage(false);
    assert_eq!(metrics.objects_relocated, 1);

    let holder = target(&heap, fresh);
    let Value::Object(moved) = heap.slot(holder, 0) else {
        panic!("slot lost its reference");
    };
    assert_ne!(moved, old);
    assert_eq!(heap.slot(moved, 0), Value::Int(7));
}

#[test]
fn test_forced_compaction_only_takes_what_fits() {
    let mut heap = Heap::with_config(HeapConfig {
        region_capacity: 4,
        max_regions: 3,
        verify_heap: true,
        ..HeapConfig::default()
    });
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let obj = heap.allocate(1);
            heap.set_slot(obj, 0, Value::Int(i));
            heap.register_global(obj, Strength::Strong, None)
        })
        .collect();
    assert_eq!(heap.region_count(), 2);

    let plain = heap.collect_garbage(false);
    assert_eq!(plain.objects_reclaimed, 0);

    // One free region: only one full region can be evacuated.
    let metrics = heap.collect_garbage(true);
    assert_eq!(metrics.collection_type, CollectionType::FullCompacting);
    assert_eq!(metrics.objects_relocated, 4);
    assert_eq!(metrics.regions_released, 1);
    assert_eq!(heap.region_count(), 2);
    for (i, &handle) in handles.iter().enumerate() {
        assert_eq!(heap.slot(target(&heap, handle), 0), Value::Int(i as i64));
    }

    let again = heap.collect_garbage(true);
    assert_eq!(again.objects_relocated, 4);
}

#[test]
fn test_region_table_stays_bounded_under_always_compact() {
    let mut heap = Heap::with_config(HeapConfig {
        always_compact: true,
        verify_heap: true,
        ..HeapConfig::default()
    });
    let obj = heap.allocate(1);
    heap.set_slot(obj, 0, Value::Int(42));
    let handle = heap.register_global(obj, Strength::Strong, None);

    for _ in 0..1000 {
        let metrics = heap.collect_garbage(false);
        assert_eq!(metrics.objects_relocated, 1);
        assert_eq!(heap.region_count(), 1);
    }
    let survivor = target(&heap, handle);
    assert!(heap.region_of(survivor).index() < 2);
    assert!(heap.region_of(survivor).generation() > 0);
    assert_eq!(heap.slot(survivor, 0), Value::Int(42));
    assert!(!heap.contains(obj));
}

#[test]
fn test_table_grown_and_shrunk_while_compacting_incrementally() {
    let mut heap = small_regions(4);
    let map = heap.create_weak_collection();
    let map = heap.register_global(map, Strength::Strong, None);

    let mut live = Vec::new();
    let mut insert = |heap: &mut Heap, i: i64, rooted: bool| {
        let collection = target(heap, map);
        let key = heap.allocate(0);
        let value = heap.allocate(1);
        heap.set_slot(value, 0, Value::Int(i));
        heap.weak_collection_set(collection, key, Value::Object(value));
        if rooted {
            live.push((heap.register_global(key, Strength::Strong, None), i));
        }
    };

    // Half of the first entries have unrooted keys and die this cycle.
    for i in 0..8 {
        insert(&mut heap, i, i % 2 == 0);
    }
    heap.start_incremental_marking(true);
    heap.mark_step(3);
    for i in 8..20 {
        insert(&mut heap, i, true);
    }
    assert!(heap.is_marking());
    assert_eq!(heap.table_stats(target(&heap, map)).capacity, 128);

    let metrics = heap.collect_garbage(false);
    assert_eq!(metrics.collection_type, CollectionType::IncrementalCompacting);
    assert_eq!(metrics.ephemeron_entries_cleared, 4);
    assert_eq!(metrics.tables_shrunk, 1);
    assert!(metrics.objects_relocated > 0);

    let collection = target(&heap, map);
    assert_eq!(
        heap.table_stats(collection),
        ephemera_gc::TableStats {
            capacity: 64,
            elements: 16,
            deleted: 0
        }
    );
    for (handle, i) in live {
        let key = target(&heap, handle);
        let Some(Value::Object(value)) = heap.weak_collection_get(collection, key) else {
            panic!("entry {i} lost its value");
        };
        assert_eq!(heap.slot(value, 0), Value::Int(i));
    }
}
