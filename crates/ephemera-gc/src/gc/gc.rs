//! Collection cycle orchestration.
//!
//! A cycle is `Marking` (possibly across several incremental steps), then
//! one atomic pause: final marking, weak processing, sweep, table
//! shrinking and, when candidates were selected, compaction.

use std::time::Instant;

use crate::gc::compact;
use crate::gc::incremental::{FallbackReason, MarkPhase, MarkSliceResult, MarkStats};
use crate::gc::marker;
use crate::gc::weak;
use crate::heap::Heap;
use crate::metrics::{record_metrics, CollectionType, GcMetrics, PhaseTimer};
use crate::object::Color;

/// Points of a collection reported to callbacks registered with
/// [`Heap::add_gc_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcEvent {
    /// A collection is about to finish marking and enter its pause.
    Prologue,
    /// Marking reached its fixed point, ephemerons included.
    MarkingComplete,
    /// Dead weak cells and ephemeron entries have been cleared; tables have
    /// not been shrunk yet.
    WeakCollectionsCleared,
    /// The collection finished.
    Epilogue,
}

/// Free every unmarked object. Returns `(reclaimed, surviving)`.
fn sweep(heap: &mut Heap) -> (usize, usize) {
    let mut reclaimed = 0;
    for obj in heap.space.live_refs() {
        let color = heap.space.color(obj);
        debug_assert_ne!(color, Some(Color::Grey), "grey object {obj} at sweep");
        if color == Some(Color::White) {
            heap.space.free(obj);
            reclaimed += 1;
        }
    }
    let space = &heap.space;
    heap.weak_collections.retain(|&c| space.get(c).is_some());

    // Empty regions are returned unless allocation is using them.
    let allocation_region = heap.space.allocation_region();
    let empty: Vec<_> = heap
        .space
        .regions()
        .filter(|r| r.live() == 0 && !r.evacuation_candidate && Some(r.id()) != allocation_region)
        .map(|r| r.id())
        .collect();
    for id in empty {
        heap.space.release(id);
    }
    (reclaimed, heap.space.object_count())
}

pub(crate) fn collect_garbage(heap: &mut Heap, force_compact: bool) -> GcMetrics {
    #[cfg(feature = "tracing")]
    let _gc_span = crate::tracing::internal::trace_gc_collection(
        force_compact,
        crate::tracing::internal::next_gc_id(),
    );

    heap.dispatch_gc_event(GcEvent::Prologue);

    let forced = force_compact || heap.config.always_compact;
    match heap.marking.phase() {
        MarkPhase::Idle => marker::start_marking(heap, forced),
        MarkPhase::Marking => {
            if forced && !heap.marking.is_compacting() {
                heap.marking.set_force_compact(true);
                marker::restart_marking(heap, FallbackReason::CompactionRequested);
            }
        }
        MarkPhase::WeakProcessing | MarkPhase::Compacting => {
            panic!("collect_garbage called from inside a collection pause")
        }
    }

    if heap.config.incremental.enabled {
        let budget = heap.config.incremental.increment_size;
        while !matches!(
            marker::mark_slice(heap, budget),
            MarkSliceResult::Complete { .. }
        ) {}
    }

    let start = Instant::now();
    let mut timer = PhaseTimer::new();

    timer.start();
    {
        #[cfg(feature = "tracing")]
        let _phase = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Mark);

        marker::finish_marking(heap);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_end(
            crate::tracing::internal::GcPhase::Mark,
            heap.marking.stats().objects_marked,
        );
    }
    timer.end_mark();
    heap.dispatch_gc_event(GcEvent::MarkingComplete);

    timer.start();
    let (handles, entries_cleared, reclaimed, surviving, shrunk) = {
        #[cfg(feature = "tracing")]
        let _phase = crate::tracing::internal::trace_phase(
            crate::tracing::internal::GcPhase::WeakProcessing,
        );

        let handles = weak::process_weak_handles(heap);
        let entries_cleared = weak::clear_weak_collections(heap);
        heap.dispatch_gc_event(GcEvent::WeakCollectionsCleared);
        let (reclaimed, surviving) = sweep(heap);
        let shrunk = weak::shrink_weak_collections(heap);

        #[cfg(feature = "tracing")]
        tracing::debug!(entries_cleared, tables_shrunk = shrunk, "weak_collections_processed");
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_phase_end(
            crate::tracing::internal::GcPhase::WeakProcessing,
            reclaimed,
        );

        (handles, entries_cleared, reclaimed, surviving, shrunk)
    };
    timer.end_weak();

    let compacting = heap.marking.is_compacting();
    let mut relocated = 0;
    let mut slots = (0, 0);
    let mut released = 0;
    if compacting {
        heap.marking.transition_to(MarkPhase::Compacting);
        timer.start();

        #[cfg(feature = "tracing")]
        let _phase =
            crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Compact);

        weak::record_weak_cells(heap);
        relocated = compact::evacuate(heap);
        slots = compact::update_slots(heap);
        released = compact::release_candidates(heap);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            relocated,
            slots_updated = slots.0,
            stale_slots = slots.1,
            regions_released = released,
            "compaction"
        );

        timer.end_compact();
    }

    heap.remembered.clear();
    heap.space.clear_evacuation_candidates();
    heap.space.promote_all();
    heap.marking.transition_to(MarkPhase::Idle);

    if heap.config.verify_heap {
        heap.verify_heap();
    }

    let stats: MarkStats = *heap.marking.stats();
    heap.marking.reset();
    heap.total_collections += 1;

    let metrics = GcMetrics {
        duration: start.elapsed(),
        mark_duration: timer.mark,
        weak_duration: timer.weak,
        compact_duration: timer.compact,
        collection_type: CollectionType::classify(stats.slices_executed > 0, compacting),
        total_collections: heap.total_collections,
        objects_marked: stats.objects_marked,
        objects_reclaimed: reclaimed,
        objects_surviving: surviving,
        slices_executed: stats.slices_executed,
        restarts: stats.restarts,
        fallback_reason: stats.fallback_reason,
        ephemeron_rounds: stats.ephemeron_rounds,
        ephemeron_entries_cleared: entries_cleared,
        tables_shrunk: shrunk,
        weak_handles_cleared: handles.cleared,
        weak_callbacks_invoked: handles.callbacks_invoked,
        objects_relocated: relocated,
        slots_updated: slots.0,
        stale_slots: slots.1,
        regions_released: released,
    };
    heap.last_metrics = metrics;
    record_metrics(metrics);

    #[cfg(feature = "tracing")]
    tracing::debug!(
        collection_type = metrics.collection_type.name(),
        reclaimed = metrics.objects_reclaimed,
        surviving = metrics.objects_surviving,
        duration_us = u64::try_from(metrics.duration.as_micros()).unwrap_or(u64::MAX),
        "gc_complete"
    );

    heap.dispatch_gc_event(GcEvent::Epilogue);
    metrics
}

impl Heap {
    /// Run a full collection cycle.
    ///
    /// Finishes an incremental mark in progress (restarting it first if it
    /// was invalidated), processes weak references, sweeps, shrinks sparse
    /// tables and, if this cycle selected evacuation candidates, compacts.
    /// `force_compact` evacuates every populated region, as far as the free
    /// cells and unopened regions can hold their objects.
    ///
    /// Raw [`ObjectRef`](crate::ObjectRef)s held across a compacting
    /// collection are invalidated; re-read them through handles or roots.
    ///
    /// # Panics
    ///
    /// Panics if called from a GC callback during a pause, if evacuation
    /// runs out of regions, or, with `verify_heap`, if the heap is
    /// inconsistent afterwards.
    pub fn collect_garbage(&mut self, force_compact: bool) -> GcMetrics {
        collect_garbage(self, force_compact)
    }

    /// Begin an incremental mark. Does nothing if one is in progress.
    ///
    /// Evacuation candidates are chosen now; `force_compact` selects every
    /// populated region whose objects fit elsewhere.
    pub fn start_incremental_marking(&mut self, force_compact: bool) {
        if self.marking.phase() == MarkPhase::Idle {
            marker::start_marking(self, force_compact || self.config.always_compact);
        }
    }

    /// Run one marking step scanning at most `budget` objects.
    ///
    /// # Panics
    ///
    /// Panics if no incremental mark is in progress.
    pub fn mark_step(&mut self, budget: usize) -> MarkSliceResult {
        assert!(
            self.marking.is_marking(),
            "mark_step requires an incremental mark in progress"
        );
        marker::mark_slice(self, budget.max(1))
    }

    /// Discard an in-progress mark: colors, worklist, evacuation candidates
    /// and recorded slots. Returns whether a mark was in progress.
    pub fn abort_incremental_marking(&mut self) -> bool {
        marker::abort_marking(self)
    }

    /// Report that a strong root was removed outside the heap's knowledge.
    ///
    /// While marking, and with
    /// [`IncrementalConfig::abort_on_root_relaxation`](crate::IncrementalConfig)
    /// set, this invalidates the mark: the next step or collection restarts
    /// it from the current roots.
    pub fn report_root_relaxed(&mut self) {
        if self.config.incremental.abort_on_root_relaxation {
            self.marking.invalidate(FallbackReason::RootRelaxed);
        }
    }

    /// Phase of the current cycle.
    #[must_use]
    pub const fn marking_phase(&self) -> MarkPhase {
        self.marking.phase()
    }

    /// Whether an incremental mark is in progress.
    #[must_use]
    pub const fn is_marking(&self) -> bool {
        self.marking.is_marking()
    }

    /// Whether the in-progress mark was invalidated and will restart.
    #[must_use]
    pub const fn is_marking_invalidated(&self) -> bool {
        self.marking.is_invalidated()
    }

    /// Counters of the in-progress mark.
    #[must_use]
    pub const fn mark_stats(&self) -> &MarkStats {
        self.marking.stats()
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub const fn last_gc_metrics(&self) -> GcMetrics {
        self.last_metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::Value;

    #[test]
    fn test_unreachable_objects_are_reclaimed() {
        let mut heap = Heap::new();
        let live = heap.allocate(1);
        let child = heap.allocate(0);
        heap.set_slot(live, 0, Value::Object(child));
        let scope = heap.enter_scope();
        heap.push_root(live);
        heap.allocate(0);

        let metrics = heap.collect_garbage(false);
        assert_eq!(metrics.objects_reclaimed, 1);
        assert_eq!(metrics.objects_surviving, 2);
        assert_eq!(metrics.collection_type, CollectionType::Full);
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.marking_phase(), MarkPhase::Idle);
        heap.leave_scope(scope);
    }

    #[test]
    fn test_survivors_stay_black_until_next_cycle() {
        let mut heap = Heap::new();
        let obj = heap.allocate(0);
        let scope = heap.enter_scope();
        heap.push_root(obj);
        heap.collect_garbage(false);
        let obj = heap.roots.get(0).unwrap();
        assert_eq!(heap.color(obj), Color::Black);
        heap.leave_scope(scope);
    }

    #[test]
    fn test_young_regions_promoted() {
        let mut heap = Heap::new();
        let obj = heap.allocate(0);
        let scope = heap.enter_scope();
        heap.push_root(obj);
        assert!(heap.is_in_young_region(obj));
        heap.collect_garbage(false);
        let obj = heap.roots.get(0).unwrap();
        assert!(!heap.is_in_young_region(obj));
        heap.leave_scope(scope);
    }

    #[test]
    fn test_incremental_config_runs_slices() {
        let mut heap = Heap::with_config(HeapConfig {
            incremental: crate::config::IncrementalConfig {
                enabled: true,
                increment_size: 1,
                ..Default::default()
            },
            ..HeapConfig::default()
        });
        let a = heap.allocate(1);
        let b = heap.allocate(0);
        heap.set_slot(a, 0, Value::Object(b));
        let scope = heap.enter_scope();
        heap.push_root(a);
        let metrics = heap.collect_garbage(false);
        assert!(metrics.slices_executed >= 2);
        assert_eq!(metrics.collection_type, CollectionType::Incremental);
        heap.leave_scope(scope);
    }
}
