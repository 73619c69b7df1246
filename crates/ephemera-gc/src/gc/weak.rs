//! Weak processing: global weak cells, ephemeron table clearing and
//! shrinking.
//!
//! Runs inside the atomic pause, after marking reached its fixed point.

use crate::gc::marker;
use crate::handles::Finalizer;
use crate::heap::Heap;
use crate::object::{ObjectRef, Value};
use crate::remembered_set::Slot;
use crate::table::EphemeronTable;

/// Counts from [`process_weak_handles`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WeakHandleOutcome {
    pub(crate) cleared: usize,
    pub(crate) callbacks_invoked: usize,
}

/// Clear weak cells whose targets died and run their finalizers.
///
/// A target with a finalizer is retained for this cycle, together with
/// everything it keeps alive (ephemeron values included), so the callback
/// still observes a live object. Weak cells without a finalizer are cleared
/// only if their target is still unmarked after that retention. Every dead
/// cell is cleared before any callback runs; a cell is never finalized
/// twice.
pub(crate) fn process_weak_handles(heap: &mut Heap) -> WeakHandleOutcome {
    let space = &heap.space;
    let pending = heap.handles.identify_dead_weak(|target| space.is_marked(target));
    if pending.is_empty() {
        return WeakHandleOutcome::default();
    }

    let mut retained = false;
    for cell in pending.iter().filter(|p| p.has_finalizer) {
        retained |= marker::shade(heap, cell.target);
    }
    let pending: Vec<_> = if retained {
        marker::drain_worklist(heap, usize::MAX);
        marker::process_ephemerons(heap);
        // Cells without a finalizer whose target was retained stay put.
        pending
            .into_iter()
            .filter(|p| p.has_finalizer || !heap.space.is_marked(p.target))
            .collect()
    } else {
        pending
    };

    let mut finalizers: Vec<(_, _, Finalizer)> = Vec::new();
    for cell in &pending {
        let hash = heap.existing_identity_hash(cell.target);
        if let Some(finalizer) = heap.handles.clear_dead(cell.handle) {
            finalizers.push((cell.handle, hash, finalizer));
        }
    }

    let outcome = WeakHandleOutcome {
        cleared: pending.len(),
        callbacks_invoked: finalizers.len(),
    };

    #[cfg(feature = "tracing")]
    tracing::debug!(
        cleared = outcome.cleared,
        callbacks = outcome.callbacks_invoked,
        "weak_handles_cleared"
    );

    for (handle, hash, finalizer) in finalizers {
        finalizer.invoke(handle, hash);
    }
    outcome
}

/// Record surviving weak cells that point into evacuation candidates.
pub(crate) fn record_weak_cells(heap: &mut Heap) {
    let cells: Vec<_> = heap.handles.weak_cells().collect();
    for (index, target) in cells {
        if heap.space.is_evacuation_candidate(target) {
            heap.remembered.record(Slot::Global(index));
        }
    }
}

fn table_of(heap: &Heap, collection: ObjectRef) -> Option<ObjectRef> {
    heap.space.get(collection).and_then(|c| c.collection_table())
}

/// Remove entries with unmarked keys from every live weak collection.
///
/// Returns the number of entries removed. Removed entries become
/// tombstones; the capacity is untouched until [`shrink_weak_collections`].
pub(crate) fn clear_weak_collections(heap: &mut Heap) -> usize {
    let mut cleared = 0;
    for collection in heap.weak_collections.clone() {
        if !heap.space.is_marked(collection) {
            continue;
        }
        let Some(table_ref) = table_of(heap, collection) else {
            continue;
        };
        let dead: Vec<usize> = match heap.space.get(table_ref).and_then(|t| t.as_table()) {
            Some(table) => table
                .entries()
                .filter(|&(_, key, _)| !heap.space.is_marked(key))
                .map(|(index, _, _)| index)
                .collect(),
            None => continue,
        };
        if dead.is_empty() {
            continue;
        }
        let table = heap
            .object_mut(table_ref)
            .as_table_mut()
            .expect("weak collection table is an ephemeron table");
        for &index in &dead {
            table.remove_entry(index);
        }
        cleared += dead.len();
    }
    cleared
}

/// Shrink sparse tables of live collections. Returns the number shrunk.
pub(crate) fn shrink_weak_collections(heap: &mut Heap) -> usize {
    let mut shrunk = 0;
    for collection in heap.weak_collections.clone() {
        let Some(table_ref) = table_of(heap, collection) else {
            continue;
        };
        let rebuilt = heap
            .space
            .get(table_ref)
            .and_then(|t| t.as_table())
            .and_then(|table| table.shrink_capacity().map(|capacity| table.rebuilt(capacity)));
        if let Some(table) = rebuilt {
            replace_table(heap, collection, table_ref, table);
            shrunk += 1;
        }
    }
    shrunk
}

/// Install `table` as the backing store of `collection`, freeing the old
/// one.
///
/// The new table is allocated like any object (black while a cycle is in
/// progress) and every reference it holds goes through the write barrier,
/// so slots into evacuation candidates are recorded.
///
/// # Panics
///
/// Panics if the heap is exhausted.
pub(crate) fn replace_table(
    heap: &mut Heap,
    collection: ObjectRef,
    old_table: ObjectRef,
    table: EphemeronTable,
) {
    let references: Vec<(usize, ObjectRef)> = table
        .entries()
        .flat_map(|(index, key, value)| {
            let value_slot = match value {
                Value::Object(obj) => Some((index * 2 + 1, obj)),
                Value::Undefined | Value::Int(_) => None,
            };
            std::iter::once((index * 2, key)).chain(value_slot)
        })
        .collect();
    let new_table = heap
        .allocate_body(crate::object::ObjectBody::Table(table))
        .unwrap_or_else(|e| panic!("fatal allocation failure while rebuilding a table: {e}"));
    for (slot, target) in references {
        marker::write_barrier(heap, new_table, slot, target);
    }
    heap.object_mut(collection)
        .write_slot(0, Value::Object(new_table));
    marker::write_barrier(heap, collection, 0, new_table);
    heap.space.free(old_table);
}
