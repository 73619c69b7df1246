//! Evacuation of candidate regions and slot updating.
//!
//! Candidates are chosen when a cycle starts so the marker knows which
//! slots to record. After weak processing every live object on a candidate
//! region is copied to a non-candidate region and its old cell becomes a
//! forwarding marker. Recorded slots are then re-pointed, and the candidate
//! regions are released.

use crate::heap::{Cell, Heap};
use crate::object::{ObjectRef, RegionId, Value};
use crate::remembered_set::Slot;

/// Flag evacuation candidates for a new cycle. Returns whether this cycle
/// compacts.
///
/// A forced cycle considers every region holding live objects. Otherwise a
/// region qualifies once its free fraction reaches the configured threshold;
/// the current allocation region is exempt. Young regions qualify whenever
/// the cycle compacts.
///
/// A candidate must be evacuated completely, so qualifying regions are taken
/// young first, then emptiest first, only while their live cells still fit
/// in the free cells left outside the candidate set plus the regions that
/// can still be opened.
pub(crate) fn select_evacuation_candidates(heap: &mut Heap, force: bool) -> bool {
    let forced = force || heap.config.always_compact;
    let threshold = heap.config.compaction_threshold;
    let capacity = heap.space.region_capacity();
    let allocation_region = heap.space.allocation_region();

    let fragmented = heap.space.regions().any(|r| {
        r.live() > 0
            && (forced
                || (Some(r.id()) != allocation_region && r.free_fraction(capacity) >= threshold))
    });
    if !fragmented {
        return false;
    }

    let mut qualifying: Vec<(bool, usize, RegionId)> = heap
        .space
        .regions()
        .filter(|r| r.live() > 0)
        .filter(|r| {
            forced
                || r.young
                || (Some(r.id()) != allocation_region && r.free_fraction(capacity) >= threshold)
        })
        .map(|r| (!r.young, r.live(), r.id()))
        .collect();
    qualifying.sort_unstable();

    let mut free_outside: usize = heap.space.regions().map(|r| capacity - r.live()).sum();
    let headroom = heap.space.headroom_regions() * capacity;
    let mut evacuated = 0;
    let mut selected = Vec::new();
    for (_, live, id) in qualifying {
        let free_after = free_outside - (capacity - live);
        if evacuated + live > free_after + headroom {
            continue;
        }
        evacuated += live;
        free_outside = free_after;
        selected.push(id);
    }
    if selected.is_empty() {
        return false;
    }

    for id in selected {
        if let Some(region) = heap.space.region_mut(id) {
            region.evacuation_candidate = true;
        }
    }
    true
}

fn candidate_regions(heap: &Heap) -> Vec<RegionId> {
    heap.space
        .regions()
        .filter(|r| r.evacuation_candidate)
        .map(|r| r.id())
        .collect()
}

/// Move every live object off the candidate regions. Returns the number
/// relocated.
pub(crate) fn evacuate(heap: &mut Heap) -> usize {
    let mut relocated = 0;
    for id in candidate_regions(heap) {
        let live: Vec<u32> = match heap.space.region(id) {
            Some(region) => region.live_indices().collect(),
            None => continue,
        };
        for index in live {
            heap.space.relocate(ObjectRef::new(id, index));
            relocated += 1;
        }
    }
    relocated
}

/// Where `holder` lives now, or `None` if the holder died.
fn resolve_holder(heap: &Heap, holder: ObjectRef) -> Option<ObjectRef> {
    match heap.space.cell(holder)? {
        Cell::Live(_) => Some(holder),
        Cell::Forwarded(to) => Some(*to),
        Cell::Free => None,
    }
}

/// Re-point recorded slots at relocated objects.
///
/// Returns `(updated, stale)`: a stale entry is one whose holder died or
/// whose slot no longer references a relocated object.
pub(crate) fn update_slots(heap: &mut Heap) -> (usize, usize) {
    let mut updated = 0;
    let mut stale = 0;
    for slot in heap.remembered.drain() {
        let patched = match slot {
            Slot::Field { holder, index } => update_field(heap, holder, index as usize),
            Slot::Global(index) => {
                match heap
                    .handles
                    .cell_target(index)
                    .and_then(|t| heap.space.forwarding(t))
                {
                    Some(to) => {
                        heap.handles.set_cell_target(index, to);
                        true
                    }
                    None => false,
                }
            }
            Slot::Root(index) => {
                match heap.roots.get(index).and_then(|t| heap.space.forwarding(t)) {
                    Some(to) => {
                        heap.roots.set(index, to);
                        true
                    }
                    None => false,
                }
            }
        };
        if patched {
            updated += 1;
        } else {
            stale += 1;
        }
    }

    let registry = std::mem::take(&mut heap.weak_collections);
    heap.weak_collections = registry
        .into_iter()
        .map(|c| heap.space.forwarding(c).unwrap_or(c))
        .collect();

    (updated, stale)
}

fn update_field(heap: &mut Heap, holder: ObjectRef, index: usize) -> bool {
    let Some(holder) = resolve_holder(heap, holder) else {
        return false;
    };
    let Some(object) = heap.space.get(holder) else {
        return false;
    };
    if index >= object.slot_count() {
        return false;
    }
    let Value::Object(target) = object.read_slot(index) else {
        return false;
    };
    let Some(to) = heap.space.forwarding(target) else {
        return false;
    };
    heap.object_mut(holder).write_slot(index, Value::Object(to));
    true
}

/// Release every evacuated region. Returns the number released.
pub(crate) fn release_candidates(heap: &mut Heap) -> usize {
    let candidates = candidate_regions(heap);
    for &id in &candidates {
        heap.space.release(id);
    }
    candidates.len()
}
