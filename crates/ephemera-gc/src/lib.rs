//! Weak references, ephemeron tables and compaction-aware weak processing
//! for a tracing garbage collector.
//!
//! `ephemera-gc` is a single-threaded arena heap with:
//!
//! - **Weak collections**: maps whose entries live exactly as long as their
//!   keys. A value is marked only once its key is proven reachable; entries
//!   with dead keys are removed after marking and sparse tables shrink.
//! - **Global references**: strong or weak off-heap cells. A weak cell may
//!   carry a one-shot finalizer that runs after the cell is cleared.
//! - **Incremental marking**: marking can proceed in bounded steps
//!   interleaved with mutation, guarded by an insertion barrier and black
//!   allocation. Relaxing a root mid-mark restarts marking from scratch.
//! - **Compaction**: fragmented regions are evacuated at the end of a cycle;
//!   recorded slots, including ephemeron keys and values, are re-pointed.
//!
//! # Quick Start
//!
//! ```
//! use ephemera_gc::{Heap, Strength, Value};
//!
//! let mut heap = Heap::new();
//! let map = heap.create_weak_collection();
//! let map = heap.register_global(map, Strength::Strong, None);
//!
//! let key = heap.allocate(0);
//! let collection = heap.global_target(map).unwrap();
//! heap.weak_collection_set(collection, key, Value::Int(1));
//! let key = heap.register_global(key, Strength::Weak, None);
//!
//! // Nothing else holds the key: the entry goes with it.
//! heap.collect_garbage(false);
//! assert!(heap.is_cleared(key));
//! let collection = heap.global_target(map).unwrap();
//! assert_eq!(heap.table_stats(collection).elements, 0);
//! ```
//!
//! # Object addresses
//!
//! An [`ObjectRef`] names a heap cell and is only valid until the next
//! collection that relocates its object. Keep durable references in
//! [`GlobalHandle`]s or on the shadow stack ([`Heap::push_root`]) and re-read
//! them after collecting.
//!
//! The slot buffer and shadow stack behind those roots are internal:
//!
//! ```compile_fail
//! use ephemera_gc::RememberedSet;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
mod error;
pub mod gc;
mod handles;
mod heap;
pub mod metrics;
mod object;
mod remembered_set;
mod roots;
pub mod table;
mod tracing;
mod weak_collection;

pub use config::{HeapConfig, IncrementalConfig};
pub use error::AllocError;
pub use gc::{FallbackReason, GcEvent, MarkPhase, MarkSliceResult, MarkStats};
pub use handles::{Finalizer, GlobalHandle, Strength, WeakCallbackInfo};
pub use heap::Heap;
pub use metrics::{gc_history, global_metrics, CollectionType, GcHistory, GcMetrics, GlobalMetrics};
pub use object::{Color, IdentityHash, ObjectKind, ObjectRef, RegionId, Value};
pub use roots::ScopeMarker;
pub use table::TableStats;
pub use crate::tracing::GcId;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::gc::incremental::MarkPhase;
    use crate::gc::marker;
    use crate::Heap;

    /// Mark to the strong fixed point without finalizing the cycle.
    ///
    /// Starts an incremental mark if none is running, then steps until the
    /// worklist is empty. The heap is left in [`MarkPhase::Marking`]; the next
    /// [`Heap::collect_garbage`] finishes the cycle.
    pub fn simulate_incremental_marking(heap: &mut Heap) {
        heap.start_incremental_marking(false);
        let budget = heap.config().incremental.increment_size;
        while !matches!(
            marker::mark_slice(heap, budget),
            crate::MarkSliceResult::Complete { .. }
        ) {}
        debug_assert_eq!(heap.marking_phase(), MarkPhase::Marking);
    }

    /// Walk the heap and panic on any dangling reference.
    pub fn verify_heap(heap: &Heap) {
        heap.verify_heap();
    }
}
