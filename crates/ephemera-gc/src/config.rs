//! Heap and collector configuration.

/// Default number of cells per region.
pub const DEFAULT_REGION_CAPACITY: usize = 256;
/// Default limit on simultaneously allocated regions.
pub const DEFAULT_MAX_REGIONS: usize = 4096;
/// Default free fraction at which a region becomes an evacuation candidate.
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.75;
/// Default seed for identity hashes.
pub const DEFAULT_HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Objects scanned per incremental step by default.
pub const DEFAULT_INCREMENT_SIZE: usize = 1000;
/// Default factor by which the worklist may outgrow its initial size before
/// a step drains without a budget.
pub const DEFAULT_WORKLIST_GROWTH_LIMIT: usize = 64;

/// Incremental marking configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrementalConfig {
    /// Mark in bounded slices during `collect_garbage`.
    pub enabled: bool,
    /// Objects scanned per slice.
    pub increment_size: usize,
    /// Once the worklist exceeds this multiple of its size at the root
    /// snapshot, the current step stops honouring its budget and drains the
    /// rest of the mark.
    pub worklist_growth_limit: usize,
    /// Invalidate an in-progress mark when a strong root is relaxed.
    pub abort_on_root_relaxation: bool,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            increment_size: DEFAULT_INCREMENT_SIZE,
            worklist_growth_limit: DEFAULT_WORKLIST_GROWTH_LIMIT,
            abort_on_root_relaxation: true,
        }
    }
}

/// Heap configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapConfig {
    /// Cells per region.
    pub region_capacity: usize,
    /// Maximum number of regions; allocation beyond it is fatal.
    pub max_regions: usize,
    /// Compact on every collection.
    pub always_compact: bool,
    /// Free fraction (after the last sweep) that makes a region an
    /// evacuation candidate.
    pub compaction_threshold: f64,
    /// Walk the heap after each collection and abort on dangling slots.
    pub verify_heap: bool,
    /// Seed for identity hash generation.
    pub hash_seed: u64,
    /// Incremental marking settings.
    pub incremental: IncrementalConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_capacity: DEFAULT_REGION_CAPACITY,
            max_regions: DEFAULT_MAX_REGIONS,
            always_compact: false,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            verify_heap: cfg!(debug_assertions),
            hash_seed: DEFAULT_HASH_SEED,
            incremental: IncrementalConfig::default(),
        }
    }
}

impl HeapConfig {
    /// # Panics
    ///
    /// Panics on a configuration the heap cannot run with.
    pub(crate) fn validate(&self) {
        assert!(self.region_capacity > 0, "region_capacity must be positive");
        assert!(
            u32::try_from(self.region_capacity).is_ok(),
            "region_capacity must fit in u32"
        );
        assert!(self.max_regions > 0, "max_regions must be positive");
        assert!(
            (0.0..=1.0).contains(&self.compaction_threshold),
            "compaction_threshold must be within 0.0..=1.0"
        );
        assert!(
            self.incremental.increment_size > 0,
            "increment_size must be positive"
        );
    }
}
