//! GC tracing support.
//!
//! With the `tracing` feature enabled, every collection runs inside a
//! `gc_collect` span and each pause phase inside a `gc_phase` span. Without
//! it only the [`GcId`] type remains.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of the atomic pause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Root rescan, final drain and the ephemeron fixed point.
        Mark,
        /// Weak cells, ephemeron clearing, sweep and table shrinking.
        WeakProcessing,
        /// Evacuation and slot updating.
        Compact,
    }

    /// Identifier correlating every event of one collection.
    ///
    /// Monotonically increasing from 1, shared by all heaps in the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Allocate the next collection id.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection.
    pub fn trace_gc_collection(force_compact: bool, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            force_compact = force_compact,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Span covering one pause phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the end of a phase with the number of objects it processed.
    pub fn log_phase_end(phase: GcPhase, objects: usize) {
        tracing::debug!(phase = ?phase, objects, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);
}

pub use internal::GcId;
