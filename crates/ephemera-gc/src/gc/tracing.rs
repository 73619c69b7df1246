//! Incremental marking events.

use super::incremental::FallbackReason;

/// Log the root snapshot of a new mark.
pub fn log_incremental_start(roots: usize, compacting: bool) {
    tracing::debug!(roots, compacting, "incremental_start");
}

/// Log the end of one marking step.
pub fn log_incremental_slice(objects_marked: usize, worklist_remaining: usize) {
    tracing::debug!(objects_marked, worklist_remaining, "incremental_slice");
}

/// Log a restart from scratch.
pub fn log_restart(reason: FallbackReason) {
    tracing::debug!(reason = ?reason, "mark_restart");
}

/// Log a fallback to atomic completion.
pub fn log_fallback(reason: FallbackReason) {
    tracing::debug!(reason = ?reason, "fallback");
}
