//! Tri-color marking, the ephemeron fixed point and the write barrier.
//!
//! White objects have not been discovered, grey objects sit in the work
//! queue, black objects have been scanned. Scanning a plain object or a
//! weak collection shades every referenced object. Scanning an ephemeron
//! table shades nothing: its entries are only traced by
//! [`process_ephemerons`], which marks a value once its key is marked.
//!
//! Every traced slot that points into an evacuation candidate is recorded in
//! the remembered set, so the compactor can re-point it after relocation.

use crate::gc::incremental::{FallbackReason, MarkPhase, MarkSliceResult};
use crate::heap::Heap;
use crate::object::{Color, ObjectKind, ObjectRef};
use crate::remembered_set::Slot;

/// Shade a white object grey and queue it. Returns whether it was white.
pub(crate) fn shade(heap: &mut Heap, obj: ObjectRef) -> bool {
    let Some(object) = heap.space.get_mut(obj) else {
        return false;
    };
    if object.color != Color::White {
        return false;
    }
    object.color = Color::Grey;
    heap.marking.push_work(obj);
    true
}

fn record_if_candidate(heap: &mut Heap, slot: Slot, target: ObjectRef) {
    if heap.space.is_evacuation_candidate(target) {
        heap.remembered.record(slot);
    }
}

/// Shade every strong root: strong global cells and shadow-stack roots.
pub(crate) fn mark_roots(heap: &mut Heap) -> usize {
    let globals: Vec<_> = heap.handles.strong_roots().collect();
    let stack: Vec<_> = heap.roots.iter().collect();
    let mut shaded = 0;
    for (index, target) in globals {
        record_if_candidate(heap, Slot::Global(index), target);
        shaded += usize::from(shade(heap, target));
    }
    for (index, target) in stack {
        record_if_candidate(heap, Slot::Root(index), target);
        shaded += usize::from(shade(heap, target));
    }
    shaded
}

/// Scan one grey object. Returns `false` if the cell no longer holds a grey
/// object (a table replaced while queued, for instance).
fn scan_object(heap: &mut Heap, obj: ObjectRef) -> bool {
    let Some(object) = heap.space.get_mut(obj) else {
        return false;
    };
    if object.color != Color::Grey {
        return false;
    }
    object.color = Color::Black;
    let traces_strongly = object.kind() != ObjectKind::EphemeronTable;
    let mut children = Vec::new();
    object.visit_slots(|index, target| children.push((index, target)));

    for (index, target) in children {
        record_if_candidate(heap, Slot::field(obj, index), target);
        if traces_strongly {
            shade(heap, target);
        }
    }
    true
}

/// Scan up to `budget` queued objects. Returns the number scanned.
pub(crate) fn drain_worklist(heap: &mut Heap, budget: usize) -> usize {
    let mut scanned = 0;
    while scanned < budget {
        let Some(obj) = heap.marking.pop_work() else {
            break;
        };
        if scan_object(heap, obj) {
            scanned += 1;
        }
    }
    heap.marking.stats_mut().objects_marked += scanned;
    scanned
}

/// Mark ephemeron values until no marked key has an unmarked value.
///
/// Each round walks every live weak collection, shades the values of entries
/// whose keys are marked, then drains the worklist. The loop stops after a
/// round that shades nothing. Returns the number of rounds.
pub(crate) fn process_ephemerons(heap: &mut Heap) -> usize {
    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut discovered = 0;
        for collection in heap.weak_collections.clone() {
            if !heap.space.is_marked(collection) {
                continue;
            }
            let pending: Vec<ObjectRef> = {
                let Some(table) = heap
                    .space
                    .get(collection)
                    .and_then(|c| c.collection_table())
                    .and_then(|t| heap.space.get(t))
                    .and_then(|t| t.as_table())
                else {
                    continue;
                };
                table
                    .entries()
                    .filter(|&(_, key, _)| heap.space.is_marked(key))
                    .filter_map(|(_, _, value)| value.as_object())
                    .filter(|&value| heap.space.color(value) == Some(Color::White))
                    .collect()
            };
            for value in pending {
                discovered += usize::from(shade(heap, value));
            }
        }
        drain_worklist(heap, usize::MAX);
        if discovered == 0 {
            break;
        }
    }
    heap.marking.stats_mut().ephemeron_rounds += rounds;
    rounds
}

/// Insertion barrier for a reference store into `holder[index]`.
pub(crate) fn write_barrier(heap: &mut Heap, holder: ObjectRef, index: usize, target: ObjectRef) {
    if !heap.marking.is_active() {
        return;
    }
    record_if_candidate(heap, Slot::field(holder, index), target);
    let shades = heap
        .space
        .get(holder)
        .is_some_and(|h| h.color == Color::Black && h.kind() != ObjectKind::EphemeronTable);
    if shades {
        shade(heap, target);
    }
}

/// A strong root was created or a weak cell strengthened.
pub(crate) fn root_added(heap: &mut Heap, slot: Slot, target: ObjectRef) {
    if !heap.marking.is_active() {
        return;
    }
    record_if_candidate(heap, slot, target);
    shade(heap, target);
}

/// A weak cell was created. Weak cells never shade their target.
pub(crate) fn weak_cell_added(heap: &mut Heap, index: u32, target: ObjectRef) {
    if heap.marking.is_active() {
        record_if_candidate(heap, Slot::Global(index), target);
    }
}

// ============================================================================
// Cycle driving
// ============================================================================

/// Discard marks and begin a new mark from the current roots.
pub(crate) fn start_marking(heap: &mut Heap, force_compact: bool) {
    heap.marking.reset_attempt();
    heap.marking.set_force_compact(force_compact);
    heap.space.set_all_colors(Color::White);
    heap.space.clear_evacuation_candidates();
    heap.remembered.clear();
    let compacting = crate::gc::compact::select_evacuation_candidates(heap, force_compact);
    heap.marking.set_compacting(compacting);
    heap.marking.transition_to(MarkPhase::Marking);
    let roots = mark_roots(heap);
    heap.marking.set_initial_worklist_size(roots);

    #[cfg(feature = "tracing")]
    crate::gc::tracing::log_incremental_start(roots, compacting);
}

/// Throw the current attempt away and start over.
pub(crate) fn restart_marking(heap: &mut Heap, reason: FallbackReason) {
    let force = heap.marking.force_compact();
    {
        let stats = heap.marking.stats_mut();
        stats.restarts += 1;
        stats.fallback_reason = Some(reason);
    }

    #[cfg(feature = "tracing")]
    crate::gc::tracing::log_restart(reason);

    start_marking(heap, force);
}

/// One bounded marking step.
pub(crate) fn mark_slice(heap: &mut Heap, budget: usize) -> MarkSliceResult {
    if let Some(reason) = heap.marking.take_invalidation() {
        restart_marking(heap, reason);
        return MarkSliceResult::Restarted { reason };
    }

    let objects_marked = drain_worklist(heap, budget);
    heap.marking.stats_mut().slices_executed += 1;

    let initial = heap.marking.initial_worklist_size();
    let limit = heap.config.incremental.worklist_growth_limit;
    if initial > 0 && heap.marking.worklist_len() > initial.saturating_mul(limit) {
        heap.marking.record_fallback(FallbackReason::WorklistUnbounded);

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_fallback(FallbackReason::WorklistUnbounded);

        drain_worklist(heap, usize::MAX);
    }

    let worklist_remaining = heap.marking.worklist_len();

    #[cfg(feature = "tracing")]
    crate::gc::tracing::log_incremental_slice(objects_marked, worklist_remaining);

    if worklist_remaining == 0 {
        let stats = heap.marking.stats();
        MarkSliceResult::Complete {
            total_objects_marked: stats.objects_marked,
            total_slices: stats.slices_executed,
        }
    } else {
        MarkSliceResult::Pending {
            objects_marked,
            worklist_remaining,
        }
    }
}

/// Finish marking atomically: restart if invalidated, rescan roots, drain,
/// then run the ephemeron fixed point.
pub(crate) fn finish_marking(heap: &mut Heap) {
    if let Some(reason) = heap.marking.take_invalidation() {
        restart_marking(heap, reason);
    }
    mark_roots(heap);
    drain_worklist(heap, usize::MAX);
    process_ephemerons(heap);
    heap.marking.transition_to(MarkPhase::WeakProcessing);
}

/// Drop an in-progress mark. Returns whether one was in progress.
pub(crate) fn abort_marking(heap: &mut Heap) -> bool {
    if !heap.marking.is_marking() {
        return false;
    }
    heap.marking.reset();
    heap.space.set_all_colors(Color::White);
    heap.space.clear_evacuation_candidates();
    heap.remembered.clear();

    #[cfg(feature = "tracing")]
    crate::gc::tracing::log_restart(FallbackReason::Aborted);

    true
}
