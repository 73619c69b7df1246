//! Incremental marking state.
//!
//! Marking can be split into bounded slices that interleave with mutator
//! execution. Between slices the heap keeps the tri-color invariant with an
//! insertion barrier and black allocation. Weak processing and compaction are
//! never incremental: once the worklist is empty the remaining work runs in
//! one atomic pause.
//!
//! An in-progress mark can be invalidated by mutator actions that relax the
//! root set. Invalidation never rolls back part of a mark; the next step
//! discards every mark and restarts from the current roots.

#![allow(clippy::module_name_repetitions)]

use crossbeam::queue::SegQueue;

use crate::object::ObjectRef;

/// Phase of the current collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkPhase {
    /// No cycle in progress.
    #[default]
    Idle,
    /// Tracing from roots, possibly across several slices.
    Marking,
    /// Atomic pause: weak cells, ephemeron tables, sweep.
    WeakProcessing,
    /// Atomic pause: evacuation and slot updating.
    Compacting,
}

/// Why a mark was restarted or fell back to atomic completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// A strong root was dropped or weakened while marking.
    RootRelaxed,
    /// A compacting collection was requested during a mark that selected no
    /// evacuation candidates.
    CompactionRequested,
    /// The worklist outgrew its configured bound; marking finished
    /// atomically.
    WorklistUnbounded,
    /// Marking was explicitly aborted.
    Aborted,
}

/// Outcome of one marking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSliceResult {
    /// Work remains.
    Pending {
        /// Objects scanned in this step.
        objects_marked: usize,
        /// Objects still queued.
        worklist_remaining: usize,
    },
    /// The strong fixed point has been reached; the cycle can finalize.
    Complete {
        /// Objects scanned over the whole mark.
        total_objects_marked: usize,
        /// Steps executed over the whole mark.
        total_slices: usize,
    },
    /// All marks were discarded and marking restarted from the roots.
    Restarted {
        /// What invalidated the previous attempt.
        reason: FallbackReason,
    },
}

/// Counters for the current cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Objects scanned (turned black).
    pub objects_marked: usize,
    /// Incremental steps executed.
    pub slices_executed: usize,
    /// Restarts from scratch.
    pub restarts: usize,
    /// Last restart or fallback reason.
    pub fallback_reason: Option<FallbackReason>,
    /// Ephemeron fixed-point rounds.
    pub ephemeron_rounds: usize,
}

/// Per-heap marking state.
#[derive(Debug, Default)]
pub(crate) struct IncrementalMarkState {
    phase: MarkPhase,
    worklist: SegQueue<ObjectRef>,
    stats: MarkStats,
    invalidation: Option<FallbackReason>,
    initial_worklist_size: usize,
    compacting: bool,
    force_compact: bool,
}

impl IncrementalMarkState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) const fn phase(&self) -> MarkPhase {
        self.phase
    }

    /// Marking or inside the pause: barrier and black allocation are on.
    pub(crate) const fn is_active(&self) -> bool {
        !matches!(self.phase, MarkPhase::Idle)
    }

    pub(crate) const fn is_marking(&self) -> bool {
        matches!(self.phase, MarkPhase::Marking)
    }

    /// # Panics
    ///
    /// Panics on a transition the cycle state machine does not allow.
    pub(crate) fn transition_to(&mut self, new_phase: MarkPhase) {
        assert!(
            Self::is_valid_transition(self.phase, new_phase),
            "invalid mark phase transition {:?} -> {new_phase:?}",
            self.phase
        );
        self.phase = new_phase;
    }

    const fn is_valid_transition(from: MarkPhase, to: MarkPhase) -> bool {
        matches!(
            (from, to),
            (MarkPhase::Idle | MarkPhase::Marking, MarkPhase::Marking)
                | (MarkPhase::Marking, MarkPhase::WeakProcessing | MarkPhase::Idle)
                | (MarkPhase::WeakProcessing, MarkPhase::Compacting | MarkPhase::Idle)
                | (MarkPhase::Compacting, MarkPhase::Idle)
        )
    }

    pub(crate) fn push_work(&self, obj: ObjectRef) {
        self.worklist.push(obj);
    }

    pub(crate) fn pop_work(&self) -> Option<ObjectRef> {
        self.worklist.pop()
    }

    pub(crate) fn worklist_is_empty(&self) -> bool {
        self.worklist.is_empty()
    }

    pub(crate) fn worklist_len(&self) -> usize {
        self.worklist.len()
    }

    pub(crate) fn reset_worklist(&mut self) {
        self.worklist = SegQueue::new();
    }

    pub(crate) fn set_initial_worklist_size(&mut self, size: usize) {
        self.initial_worklist_size = size;
    }

    pub(crate) const fn initial_worklist_size(&self) -> usize {
        self.initial_worklist_size
    }

    /// Flag the current mark as unsound; the next step restarts it.
    pub(crate) fn invalidate(&mut self, reason: FallbackReason) {
        if self.is_marking() && self.invalidation.is_none() {
            self.invalidation = Some(reason);
        }
    }

    pub(crate) const fn is_invalidated(&self) -> bool {
        self.invalidation.is_some()
    }

    pub(crate) fn take_invalidation(&mut self) -> Option<FallbackReason> {
        self.invalidation.take()
    }

    pub(crate) fn record_fallback(&mut self, reason: FallbackReason) {
        self.stats.fallback_reason = Some(reason);
    }

    pub(crate) const fn is_compacting(&self) -> bool {
        self.compacting
    }

    pub(crate) fn set_compacting(&mut self, compacting: bool) {
        self.compacting = compacting;
    }

    pub(crate) const fn force_compact(&self) -> bool {
        self.force_compact
    }

    pub(crate) fn set_force_compact(&mut self, force: bool) {
        self.force_compact = force;
    }

    pub(crate) const fn stats(&self) -> &MarkStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut MarkStats {
        &mut self.stats
    }

    /// Forget the current attempt but keep the cycle's counters.
    pub(crate) fn reset_attempt(&mut self) {
        self.reset_worklist();
        self.invalidation = None;
        self.initial_worklist_size = 0;
        self.compacting = false;
    }

    /// Forget everything, including counters, and return to idle.
    pub(crate) fn reset(&mut self) {
        self.reset_attempt();
        self.phase = MarkPhase::Idle;
        self.stats = MarkStats::default();
        self.force_compact = false;
    }
}
