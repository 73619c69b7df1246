//! GC metrics and statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use crate::gc::incremental::FallbackReason;

/// Statistics from one garbage collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMetrics {
    /// Wall time of the final atomic pause and any marking it finished.
    pub duration: Duration,
    /// Duration of the final marking work (root rescan, drain, ephemerons).
    pub mark_duration: Duration,
    /// Duration of weak processing and sweeping.
    pub weak_duration: Duration,
    /// Duration of evacuation and slot updating.
    pub compact_duration: Duration,
    /// Kind of collection.
    pub collection_type: CollectionType,
    /// Collections run by this heap, this one included.
    pub total_collections: usize,
    /// Objects scanned by the marker.
    pub objects_marked: usize,
    /// Objects freed by the sweep.
    pub objects_reclaimed: usize,
    /// Objects alive after the sweep.
    pub objects_surviving: usize,
    /// Incremental steps executed before the pause.
    pub slices_executed: usize,
    /// Times marking restarted from scratch.
    pub restarts: usize,
    /// Last restart or fallback reason.
    pub fallback_reason: Option<FallbackReason>,
    /// Rounds of the ephemeron fixed point.
    pub ephemeron_rounds: usize,
    /// Ephemeron entries removed because their key died.
    pub ephemeron_entries_cleared: usize,
    /// Tables rebuilt at a smaller capacity.
    pub tables_shrunk: usize,
    /// Weak global cells cleared.
    pub weak_handles_cleared: usize,
    /// Finalization callbacks invoked.
    pub weak_callbacks_invoked: usize,
    /// Objects moved by compaction.
    pub objects_relocated: usize,
    /// Recorded slots re-pointed at relocated objects.
    pub slots_updated: usize,
    /// Recorded slots skipped as stale.
    pub stale_slots: usize,
    /// Regions released after evacuation.
    pub regions_released: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Metrics with every field zeroed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            weak_duration: Duration::ZERO,
            compact_duration: Duration::ZERO,
            collection_type: CollectionType::None,
            total_collections: 0,
            objects_marked: 0,
            objects_reclaimed: 0,
            objects_surviving: 0,
            slices_executed: 0,
            restarts: 0,
            fallback_reason: None,
            ephemeron_rounds: 0,
            ephemeron_entries_cleared: 0,
            tables_shrunk: 0,
            weak_handles_cleared: 0,
            weak_callbacks_invoked: 0,
            objects_relocated: 0,
            slots_updated: 0,
            stale_slots: 0,
            regions_released: 0,
        }
    }
}

/// Type of collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None,
    /// Marking ran in one atomic pause.
    Full,
    /// Marking ran in incremental steps before the pause.
    Incremental,
    /// An atomic collection that also evacuated regions.
    FullCompacting,
    /// An incremental collection that also evacuated regions.
    IncrementalCompacting,
}

impl CollectionType {
    pub(crate) const fn classify(incremental: bool, compacting: bool) -> Self {
        match (incremental, compacting) {
            (false, false) => Self::Full,
            (true, false) => Self::Incremental,
            (false, true) => Self::FullCompacting,
            (true, true) => Self::IncrementalCompacting,
        }
    }

    /// Whether the collection evacuated regions.
    #[must_use]
    pub const fn is_compacting(self) -> bool {
        matches!(self, Self::FullCompacting | Self::IncrementalCompacting)
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::FullCompacting => "full_compacting",
            Self::IncrementalCompacting => "incremental_compacting",
        }
    }
}

/// Captures phase durations of a collection.
///
/// ```
/// use ephemera_gc::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking ...
/// timer.end_mark();
/// timer.start();
/// // ... weak processing ...
/// timer.end_weak();
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Final marking time.
    pub mark: Duration,
    /// Weak processing and sweep time.
    pub weak: Duration,
    /// Compaction time.
    pub compact: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// A timer with all durations zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            weak: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End the mark phase.
    pub fn end_mark(&mut self) {
        self.mark = self.take();
    }

    /// End weak processing.
    pub fn end_weak(&mut self) {
        self.weak = self.take();
    }

    /// End compaction.
    pub fn end_compact(&mut self) {
        self.compact = self.take();
    }
}

/// Process-wide cumulative statistics over every heap.
///
/// ```
/// use ephemera_gc::global_metrics;
///
/// let metrics = global_metrics();
/// println!("collections: {}", metrics.total_collections());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    incremental_collections: AtomicUsize,
    compacting_collections: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    entries_cleared: AtomicUsize,
    callbacks_invoked: AtomicUsize,
    restarts: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// All counters zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            incremental_collections: AtomicUsize::new(0),
            compacting_collections: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            entries_cleared: AtomicUsize::new(0),
            callbacks_invoked: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Collections of any kind.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Collections whose marking ran incrementally.
    #[inline]
    #[must_use]
    pub fn total_incremental_collections(&self) -> usize {
        self.incremental_collections.load(Ordering::Relaxed)
    }

    /// Collections that evacuated regions.
    #[inline]
    #[must_use]
    pub fn total_compacting_collections(&self) -> usize {
        self.compacting_collections.load(Ordering::Relaxed)
    }

    /// Objects freed.
    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Ephemeron entries removed with their keys.
    #[inline]
    #[must_use]
    pub fn total_entries_cleared(&self) -> usize {
        self.entries_cleared.load(Ordering::Relaxed)
    }

    /// Finalization callbacks invoked.
    #[inline]
    #[must_use]
    pub fn total_callbacks_invoked(&self) -> usize {
        self.callbacks_invoked.load(Ordering::Relaxed)
    }

    /// Marking restarts.
    #[inline]
    #[must_use]
    pub fn total_restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Accumulated pause time in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Process-wide cumulative metrics.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Number of collections kept by [`GcHistory`].
pub const HISTORY_SIZE: usize = 64;

/// Ring buffer of recent [`GcMetrics`], shared by every heap in the process.
///
/// ```
/// use ephemera_gc::gc_history;
///
/// let history = gc_history();
/// println!("average pause: {:?}", history.average_pause_time(10));
/// ```
#[derive(Debug)]
pub struct GcHistory {
    buffer: Mutex<VecDeque<GcMetrics>>,
    recorded: AtomicUsize,
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    /// An empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buffer: parking_lot::const_mutex(VecDeque::new()),
            recorded: AtomicUsize::new(0),
        }
    }

    fn push(&self, metrics: GcMetrics) {
        let mut buffer = self.buffer.lock();
        if buffer.len() == HISTORY_SIZE {
            buffer.pop_front();
        }
        buffer.push_back(metrics);
        self.recorded.fetch_add(1, Ordering::Release);
    }

    /// Collections recorded so far; may exceed [`HISTORY_SIZE`].
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.recorded.load(Ordering::Acquire)
    }

    /// The most recent `n` snapshots, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcMetrics> {
        let buffer = self.buffer.lock();
        let skip = buffer.len().saturating_sub(n);
        buffer.iter().skip(skip).copied().collect()
    }

    /// Mean pause over the most recent `n` collections.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = recent.iter().map(|m| m.duration).sum();
        total / u32::try_from(recent.len()).unwrap_or(u32::MAX)
    }

    /// Longest pause over the most recent `n` collections.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|m| m.duration)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

static GC_HISTORY: GcHistory = GcHistory::new();

/// Process-wide collection history.
#[must_use]
pub fn gc_history() -> &'static GcHistory {
    &GC_HISTORY
}

/// Fold one collection into the process-wide counters and history.
pub(crate) fn record_metrics(metrics: GcMetrics) {
    let g = global_metrics();
    g.collections.fetch_add(1, Ordering::Relaxed);
    if metrics.slices_executed > 0 {
        g.incremental_collections.fetch_add(1, Ordering::Relaxed);
    }
    if metrics.collection_type.is_compacting() {
        g.compacting_collections.fetch_add(1, Ordering::Relaxed);
    }
    g.objects_reclaimed
        .fetch_add(metrics.objects_reclaimed, Ordering::Relaxed);
    g.entries_cleared
        .fetch_add(metrics.ephemeron_entries_cleared, Ordering::Relaxed);
    g.callbacks_invoked
        .fetch_add(metrics.weak_callbacks_invoked, Ordering::Relaxed);
    g.restarts.fetch_add(metrics.restarts, Ordering::Relaxed);
    g.pause_ns.fetch_add(
        metrics.duration.as_nanos().try_into().unwrap_or(u64::MAX),
        Ordering::Relaxed,
    );

    GC_HISTORY.push(metrics);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_metrics_default_to_zero() {
        let metrics = GcMetrics::new();
        assert_eq!(metrics.duration, Duration::ZERO);
        assert_eq!(metrics.collection_type, CollectionType::None);
        assert_eq!(metrics.ephemeron_rounds, 0);
        assert_eq!(metrics.fallback_reason, None);
    }

    #[test]
    fn test_phase_timer_captures_durations() {
        let mut timer = PhaseTimer::new();
        assert!(timer.current_start.is_none());

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        assert!(timer.mark > Duration::ZERO);
        assert!(timer.current_start.is_none());

        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_weak();
        assert!(timer.weak > Duration::ZERO);

        timer.end_compact();
        assert_eq!(timer.compact, Duration::ZERO);
    }

    #[test]
    fn test_collection_type_classify() {
        assert_eq!(CollectionType::classify(false, false), CollectionType::Full);
        assert_eq!(
            CollectionType::classify(true, true),
            CollectionType::IncrementalCompacting
        );
        assert!(CollectionType::FullCompacting.is_compacting());
        assert!(!CollectionType::Incremental.is_compacting());
    }

    #[test]
    fn test_gc_history_ring_buffer() {
        let history = GcHistory::new();
        assert!(history.recent(10).is_empty());
        assert_eq!(history.average_pause_time(10), Duration::ZERO);

        for ms in 1..=(HISTORY_SIZE as u64 + 6) {
            history.push(GcMetrics {
                duration: Duration::from_millis(ms),
                ..GcMetrics::new()
            });
        }
        assert_eq!(history.total_recorded(), HISTORY_SIZE + 6);
        assert_eq!(history.recent(usize::MAX).len(), HISTORY_SIZE);

        let last_two = history.recent(2);
        assert_eq!(last_two[1].duration, Duration::from_millis(HISTORY_SIZE as u64 + 6));
        assert_eq!(
            history.max_pause_time(2),
            Duration::from_millis(HISTORY_SIZE as u64 + 6)
        );
        assert_eq!(
            history.average_pause_time(2),
            Duration::from_micros((HISTORY_SIZE as u64 + 5) * 1000 + 500)
        );
    }
}
