//! Garbage collection: marking, weak processing and compaction.
//!
//! - [`incremental`]: phases, step results and marking counters
//! - `marker`: tri-color marking, the ephemeron fixed point, the write barrier
//! - `weak`: global weak cells and ephemeron table clearing and shrinking
//! - `compact`: evacuation and remembered-set driven slot updating

#[allow(clippy::module_inception)]
mod gc;

pub(crate) mod compact;
pub mod incremental;
pub(crate) mod marker;
pub(crate) mod weak;

#[cfg(feature = "tracing")]
pub mod tracing;

pub use gc::GcEvent;
pub use incremental::{FallbackReason, MarkPhase, MarkSliceResult, MarkStats};
