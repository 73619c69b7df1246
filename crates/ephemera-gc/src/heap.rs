//! Region-based object storage and the [`Heap`] handle.
//!
//! Objects live in cells of fixed-size regions. A region is the unit the
//! compactor evacuates: when it is flagged as an evacuation candidate every
//! live object on it is copied elsewhere and its cell becomes a forwarding
//! marker until the region is released.
//!
//! Regions opened since the last collection are *young*. Every full
//! collection promotes all regions to old.

use std::fmt;

use crate::config::HeapConfig;
use crate::error::AllocError;
use crate::gc::incremental::IncrementalMarkState;
use crate::gc::GcEvent;
use crate::handles::{Finalizer, GlobalHandle, GlobalHandles, Strength};
use crate::metrics::GcMetrics;
use crate::object::{Color, HeapObject, IdentityHash, ObjectBody, ObjectKind, ObjectRef, RegionId, Value};
use crate::remembered_set::{RememberedSet, Slot};
use crate::roots::{ScopeMarker, ShadowStack};

// ============================================================================
// Cells and regions
// ============================================================================

#[derive(Debug)]
pub(crate) enum Cell {
    Free,
    Live(HeapObject),
    Forwarded(ObjectRef),
}

#[derive(Debug)]
pub(crate) struct Region {
    id: RegionId,
    cells: Vec<Cell>,
    free_list: Vec<u32>,
    live: usize,
    pub(crate) young: bool,
    pub(crate) evacuation_candidate: bool,
}

impl Region {
    fn new(id: RegionId, capacity: usize, young: bool) -> Self {
        Self {
            id,
            cells: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            live: 0,
            young,
            evacuation_candidate: false,
        }
    }

    pub(crate) const fn id(&self) -> RegionId {
        self.id
    }

    pub(crate) const fn live(&self) -> usize {
        self.live
    }

    fn has_room(&self, capacity: usize) -> bool {
        !self.free_list.is_empty() || self.cells.len() < capacity
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn free_fraction(&self, capacity: usize) -> f64 {
        1.0 - self.live as f64 / capacity as f64
    }

    fn place(&mut self, object: HeapObject, capacity: usize) -> Option<u32> {
        let index = if let Some(index) = self.free_list.pop() {
            self.cells[index as usize] = Cell::Live(object);
            index
        } else if self.cells.len() < capacity {
            self.cells.push(Cell::Live(object));
            u32::try_from(self.cells.len() - 1).ok()?
        } else {
            return None;
        };
        self.live += 1;
        Some(index)
    }

    pub(crate) fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.cells
            .iter()
            .zip(0u32..)
            .filter_map(|(cell, index)| matches!(cell, Cell::Live(_)).then_some(index))
    }
}

/// The set of regions plus the allocation cursor.
///
/// A released region leaves its slot empty; the slot is reused by the next
/// region opened there, under a bumped generation so stale addresses into
/// the old region never resolve.
#[derive(Debug)]
pub(crate) struct Space {
    regions: Vec<Option<Region>>,
    released: Vec<RegionId>,
    allocation_region: Option<RegionId>,
    reusable: Vec<RegionId>,
    region_capacity: usize,
    max_regions: usize,
    region_count: usize,
    object_count: usize,
}

impl Space {
    fn new(config: &HeapConfig) -> Self {
        Self {
            regions: Vec::new(),
            released: Vec::new(),
            allocation_region: None,
            reusable: Vec::new(),
            region_capacity: config.region_capacity,
            max_regions: config.max_regions,
            region_count: 0,
            object_count: 0,
        }
    }

    pub(crate) const fn region_capacity(&self) -> usize {
        self.region_capacity
    }

    pub(crate) const fn allocation_region(&self) -> Option<RegionId> {
        self.allocation_region
    }

    pub(crate) fn region(&self, id: RegionId) -> Option<&Region> {
        self.regions
            .get(id.index())
            .and_then(Option::as_ref)
            .filter(|r| r.id == id)
    }

    pub(crate) fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.regions
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|r| r.id == id)
    }

    /// Regions that can still be opened before `max_regions` is reached.
    pub(crate) const fn headroom_regions(&self) -> usize {
        self.max_regions.saturating_sub(self.region_count)
    }

    /// Length of the region table, released slots included.
    #[cfg(test)]
    pub(crate) fn region_slots(&self) -> usize {
        self.regions.len()
    }

    pub(crate) fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().flatten()
    }

    pub(crate) fn regions_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        self.regions.iter_mut().flatten()
    }

    fn usable(&self, id: RegionId) -> bool {
        self.region(id)
            .is_some_and(|r| !r.evacuation_candidate && r.has_room(self.region_capacity))
    }

    /// Place an object, skipping evacuation candidates.
    pub(crate) fn allocate(&mut self, object: HeapObject) -> Result<ObjectRef, AllocError> {
        if !self.allocation_region.is_some_and(|id| self.usable(id)) {
            self.allocation_region = None;
            while let Some(id) = self.reusable.pop() {
                if self.usable(id) {
                    self.allocation_region = Some(id);
                    break;
                }
            }
        }
        let id = match self.allocation_region {
            Some(id) => id,
            None => {
                let id = self.open_region()?;
                self.allocation_region = Some(id);
                id
            }
        };
        let capacity = self.region_capacity;
        let region = self.region_mut(id).expect("allocation region exists");
        let index = region
            .place(object, capacity)
            .expect("allocation region has room");
        self.object_count += 1;
        Ok(ObjectRef::new(id, index))
    }

    fn open_region(&mut self) -> Result<RegionId, AllocError> {
        if self.region_count >= self.max_regions {
            return Err(AllocError::HeapExhausted {
                max_regions: self.max_regions,
            });
        }
        let id = if let Some(old) = self.released.pop() {
            let id = old.next_generation();
            self.regions[id.index()] = Some(Region::new(id, self.region_capacity, true));
            id
        } else {
            let raw = u32::try_from(self.regions.len()).map_err(|_| AllocError::HeapExhausted {
                max_regions: self.max_regions,
            })?;
            let id = RegionId::new(raw, 0);
            self.regions
                .push(Some(Region::new(id, self.region_capacity, true)));
            id
        };
        self.region_count += 1;
        Ok(id)
    }

    pub(crate) fn cell(&self, obj: ObjectRef) -> Option<&Cell> {
        self.region(obj.region())?.cells.get(obj.index())
    }

    pub(crate) fn get(&self, obj: ObjectRef) -> Option<&HeapObject> {
        match self.cell(obj)? {
            Cell::Live(object) => Some(object),
            Cell::Free | Cell::Forwarded(_) => None,
        }
    }

    pub(crate) fn get_mut(&mut self, obj: ObjectRef) -> Option<&mut HeapObject> {
        match self.region_mut(obj.region())?.cells.get_mut(obj.index())? {
            Cell::Live(object) => Some(object),
            Cell::Free | Cell::Forwarded(_) => None,
        }
    }

    pub(crate) fn color(&self, obj: ObjectRef) -> Option<Color> {
        self.get(obj).map(|o| o.color)
    }

    pub(crate) fn is_marked(&self, obj: ObjectRef) -> bool {
        self.color(obj).is_some_and(Color::is_marked)
    }

    /// New address of a relocated object.
    pub(crate) fn forwarding(&self, obj: ObjectRef) -> Option<ObjectRef> {
        match self.cell(obj)? {
            Cell::Forwarded(to) => Some(*to),
            Cell::Free | Cell::Live(_) => None,
        }
    }

    pub(crate) fn is_evacuation_candidate(&self, obj: ObjectRef) -> bool {
        self.region(obj.region())
            .is_some_and(|r| r.evacuation_candidate)
    }

    pub(crate) fn free(&mut self, obj: ObjectRef) {
        let region = self
            .region_mut(obj.region())
            .unwrap_or_else(|| panic!("free of {obj} in a released region"));
        let cell = &mut region.cells[obj.index()];
        assert!(matches!(cell, Cell::Live(_)), "double free of {obj}");
        *cell = Cell::Free;
        region.free_list.push(u32::try_from(obj.index()).expect("cell index fits u32"));
        region.live -= 1;
        let id = region.id;
        self.object_count -= 1;
        if !self.reusable.contains(&id) {
            self.reusable.push(id);
        }
    }

    /// Move a live object out of its (candidate) region.
    ///
    /// # Panics
    ///
    /// Panics when no target cell can be found; running out of memory while
    /// evacuating is fatal.
    pub(crate) fn relocate(&mut self, from: ObjectRef) -> ObjectRef {
        let region = self.region_mut(from.region()).expect("relocating from a live region");
        let cell = std::mem::replace(&mut region.cells[from.index()], Cell::Free);
        let Cell::Live(object) = cell else {
            panic!("relocating non-live cell {from}");
        };
        region.live -= 1;
        self.object_count -= 1;
        let to = self
            .allocate(object)
            .unwrap_or_else(|e| panic!("fatal: {e} while evacuating {from}"));
        let region = self.region_mut(from.region()).expect("source region still present");
        region.cells[from.index()] = Cell::Forwarded(to);
        to
    }

    pub(crate) fn release(&mut self, id: RegionId) {
        let slot = self
            .regions
            .get_mut(id.index())
            .filter(|slot| slot.as_ref().is_some_and(|r| r.id == id));
        if let Some(region) = slot.and_then(Option::take) {
            debug_assert_eq!(region.live, 0, "released region {id:?} still has live objects");
            self.region_count -= 1;
            self.released.push(id);
        }
        if self.allocation_region == Some(id) {
            self.allocation_region = None;
        }
        self.reusable.retain(|r| *r != id);
    }

    pub(crate) fn iter_live(&self) -> impl Iterator<Item = (ObjectRef, &HeapObject)> {
        self.regions().flat_map(|region| {
            region.cells.iter().zip(0u32..).filter_map(move |(cell, index)| match cell {
                Cell::Live(object) => Some((ObjectRef::new(region.id, index), object)),
                Cell::Free | Cell::Forwarded(_) => None,
            })
        })
    }

    pub(crate) fn live_refs(&self) -> Vec<ObjectRef> {
        self.iter_live().map(|(obj, _)| obj).collect()
    }

    pub(crate) fn set_all_colors(&mut self, color: Color) {
        for region in self.regions_mut() {
            for cell in &mut region.cells {
                if let Cell::Live(object) = cell {
                    object.color = color;
                }
            }
        }
    }

    pub(crate) fn clear_evacuation_candidates(&mut self) {
        for region in self.regions_mut() {
            region.evacuation_candidate = false;
        }
    }

    pub(crate) fn promote_all(&mut self) {
        for region in self.regions_mut() {
            region.young = false;
        }
    }

    pub(crate) const fn object_count(&self) -> usize {
        self.object_count
    }

    pub(crate) const fn region_count(&self) -> usize {
        self.region_count
    }
}

// ============================================================================
// Heap
// ============================================================================

pub(crate) type GcCallback = Box<dyn FnMut(GcEvent, &Heap)>;

/// A garbage-collected heap with weak collections and global references.
///
/// The heap is single-threaded: the mutator and the collector take turns
/// through `&mut Heap`. Marking can be split into bounded steps
/// ([`Heap::mark_step`]) interleaved with mutation; weak processing and
/// compaction always run in one atomic pause.
///
/// # Example
///
/// ```
/// use ephemera_gc::{Heap, Strength, Value};
///
/// let mut heap = Heap::new();
/// let map = heap.create_weak_collection();
/// let map_handle = heap.register_global(map, Strength::Strong, None);
///
/// let key = heap.allocate(0);
/// let key_handle = heap.register_global(key, Strength::Strong, None);
/// heap.weak_collection_set(map, key, Value::Int(7));
///
/// heap.collect_garbage(false);
/// let map = heap.global_target(map_handle).unwrap();
/// let key = heap.global_target(key_handle).unwrap();
/// assert_eq!(heap.weak_collection_get(map, key), Some(Value::Int(7)));
/// ```
pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) space: Space,
    pub(crate) handles: GlobalHandles,
    pub(crate) roots: ShadowStack,
    pub(crate) remembered: RememberedSet,
    pub(crate) weak_collections: Vec<ObjectRef>,
    pub(crate) marking: IncrementalMarkState,
    pub(crate) last_metrics: GcMetrics,
    pub(crate) total_collections: usize,
    hash_state: u64,
    gc_callbacks: Vec<GcCallback>,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.space.object_count())
            .field("regions", &self.space.region_count())
            .field("global_handles", &self.handles.len())
            .field("roots", &self.roots.len())
            .field("weak_collections", &self.weak_collections.len())
            .field("phase", &self.marking.phase())
            .finish_non_exhaustive()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create a heap with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Create a heap with `config`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    pub fn with_config(config: HeapConfig) -> Self {
        config.validate();
        Self {
            space: Space::new(&config),
            handles: GlobalHandles::new(),
            roots: ShadowStack::new(),
            remembered: RememberedSet::new(),
            weak_collections: Vec::new(),
            marking: IncrementalMarkState::new(),
            last_metrics: GcMetrics::new(),
            total_collections: 0,
            hash_state: config.hash_seed,
            gc_callbacks: Vec::new(),
            config,
        }
    }

    /// The heap's configuration.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Allocation and object access
    // ------------------------------------------------------------------

    /// Allocate a plain object with `slots` undefined reference slots.
    ///
    /// # Panics
    ///
    /// Panics when the heap is exhausted; allocation failure is fatal.
    pub fn allocate(&mut self, slots: usize) -> ObjectRef {
        self.try_allocate(slots)
            .unwrap_or_else(|e| panic!("fatal allocation failure: {e}"))
    }

    /// Allocate a plain object, reporting exhaustion as an error.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::HeapExhausted`] when no region has room and the
    /// region limit has been reached.
    pub fn try_allocate(&mut self, slots: usize) -> Result<ObjectRef, AllocError> {
        self.allocate_body(ObjectBody::Plain(vec![Value::Undefined; slots]))
    }

    pub(crate) fn allocate_body(&mut self, body: ObjectBody) -> Result<ObjectRef, AllocError> {
        // Objects born while marking is active are black.
        let color = if self.marking.is_active() {
            Color::Black
        } else {
            Color::White
        };
        self.space.allocate(HeapObject::new(body, color))
    }

    pub(crate) fn object(&self, obj: ObjectRef) -> &HeapObject {
        self.space
            .get(obj)
            .unwrap_or_else(|| panic!("{obj} does not name a live object"))
    }

    pub(crate) fn object_mut(&mut self, obj: ObjectRef) -> &mut HeapObject {
        self.space
            .get_mut(obj)
            .unwrap_or_else(|| panic!("{obj} does not name a live object"))
    }

    /// Whether `obj` names a live object.
    #[must_use]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.space.get(obj).is_some()
    }

    /// Kind of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object.
    #[must_use]
    pub fn kind(&self, obj: ObjectRef) -> ObjectKind {
        self.object(obj).kind()
    }

    /// Number of slots of a plain object.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live plain object.
    #[must_use]
    pub fn slot_count(&self, obj: ObjectRef) -> usize {
        let object = self.object(obj);
        assert_eq!(object.kind(), ObjectKind::Plain, "{obj} is not a plain object");
        object.slot_count()
    }

    /// Read slot `index` of a plain object.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live plain object or `index` is out of range.
    #[must_use]
    pub fn slot(&self, obj: ObjectRef, index: usize) -> Value {
        let count = self.slot_count(obj);
        assert!(index < count, "slot {index} out of range for {obj} ({count} slots)");
        self.object(obj).read_slot(index)
    }

    /// Write slot `index` of a plain object, applying the write barrier.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live plain object, `index` is out of range,
    /// or `value` references a dead object.
    pub fn set_slot(&mut self, obj: ObjectRef, index: usize, value: Value) {
        let count = self.slot_count(obj);
        assert!(index < count, "slot {index} out of range for {obj} ({count} slots)");
        if let Value::Object(target) = value {
            assert!(self.contains(target), "storing dead object {target}");
        }
        self.object_mut(obj).write_slot(index, value);
        if let Value::Object(target) = value {
            crate::gc::marker::write_barrier(self, obj, index, target);
        }
    }

    /// Identity hash of `obj`, assigning one on first use.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object.
    pub fn identity_hash(&mut self, obj: ObjectRef) -> IdentityHash {
        if let Some(hash) = self.object(obj).identity_hash() {
            return hash;
        }
        let hash = self.next_identity_hash();
        self.object_mut(obj).assign_identity_hash(hash);
        hash
    }

    /// Identity hash of `obj` if one was assigned.
    #[must_use]
    pub fn existing_identity_hash(&self, obj: ObjectRef) -> Option<IdentityHash> {
        self.space.get(obj).and_then(HeapObject::identity_hash)
    }

    fn next_identity_hash(&mut self) -> IdentityHash {
        // splitmix64
        self.hash_state = self.hash_state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.hash_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        #[allow(clippy::cast_possible_truncation)]
        let raw = (z as u32) & IdentityHash::MASK;
        IdentityHash::new(raw.max(1))
    }

    /// Marking color of `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object.
    #[must_use]
    pub fn color(&self, obj: ObjectRef) -> Color {
        self.object(obj).color
    }

    /// Number of live objects.
    #[must_use]
    pub const fn object_count(&self) -> usize {
        self.space.object_count()
    }

    // ------------------------------------------------------------------
    // Region bookkeeping
    // ------------------------------------------------------------------

    /// Region holding `obj`.
    #[must_use]
    pub const fn region_of(&self, obj: ObjectRef) -> RegionId {
        obj.region()
    }

    /// Whether `obj` lives in a region opened since the last collection.
    #[must_use]
    pub fn is_in_young_region(&self, obj: ObjectRef) -> bool {
        self.space.region(obj.region()).is_some_and(|r| r.young)
    }

    /// Whether `region` is flagged for evacuation in the current cycle.
    #[must_use]
    pub fn is_evacuation_candidate(&self, region: RegionId) -> bool {
        self.space.region(region).is_some_and(|r| r.evacuation_candidate)
    }

    /// Number of allocated regions.
    #[must_use]
    pub const fn region_count(&self) -> usize {
        self.space.region_count()
    }

    // ------------------------------------------------------------------
    // Shadow-stack roots
    // ------------------------------------------------------------------

    /// Open a root scope.
    pub fn enter_scope(&mut self) -> ScopeMarker {
        self.roots.push_frame()
    }

    /// Root `obj` in the innermost scope.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object.
    pub fn push_root(&mut self, obj: ObjectRef) {
        assert!(self.contains(obj), "rooting dead object {obj}");
        let index = self.roots.push(obj);
        crate::gc::marker::root_added(self, Slot::Root(index), obj);
    }

    /// Close a scope, dropping the roots pushed inside it.
    ///
    /// Dropping roots while incremental marking is in progress relaxes the
    /// root set (see [`Heap::report_root_relaxed`]).
    ///
    /// # Panics
    ///
    /// Panics if scopes are not left in LIFO order.
    pub fn leave_scope(&mut self, marker: ScopeMarker) {
        if self.roots.pop_frame(marker) {
            self.report_root_relaxed();
        }
    }

    /// Number of shadow-stack roots.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    // ------------------------------------------------------------------
    // Global references
    // ------------------------------------------------------------------

    /// Register a global reference to `obj`.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is not a live object, or a finalizer is supplied for
    /// a strong cell.
    pub fn register_global(
        &mut self,
        obj: ObjectRef,
        strength: Strength,
        finalizer: Option<Finalizer>,
    ) -> GlobalHandle {
        assert!(self.contains(obj), "global reference to dead object {obj}");
        let handle = self.handles.create(obj, strength, finalizer);
        match strength {
            Strength::Strong => crate::gc::marker::root_added(self, Slot::Global(handle.index()), obj),
            Strength::Weak => crate::gc::marker::weak_cell_added(self, handle.index(), obj),
        }
        handle
    }

    /// Make a global cell weak, replacing any previous finalizer.
    ///
    /// # Panics
    ///
    /// Panics if the handle was disposed.
    pub fn make_weak(&mut self, handle: GlobalHandle, finalizer: Option<Finalizer>) {
        if self.handles.make_weak(handle, finalizer) {
            self.report_root_relaxed();
        }
    }

    /// Make a global cell strong again, dropping its finalizer.
    ///
    /// # Panics
    ///
    /// Panics if the handle was disposed.
    pub fn clear_weak(&mut self, handle: GlobalHandle) {
        if let Some(target) = self.handles.clear_weak(handle) {
            crate::gc::marker::root_added(self, Slot::Global(handle.index()), target);
        }
    }

    /// Whether a global cell is weak.
    ///
    /// # Panics
    ///
    /// Panics if the handle was disposed.
    #[must_use]
    pub fn is_weak(&self, handle: GlobalHandle) -> bool {
        self.handles.is_weak(handle)
    }

    /// Current target of a global cell; `None` once a weak cell is cleared.
    ///
    /// # Panics
    ///
    /// Panics if the handle was disposed.
    #[must_use]
    pub fn global_target(&self, handle: GlobalHandle) -> Option<ObjectRef> {
        self.handles.target(handle)
    }

    /// Whether a weak cell has been cleared by the collector.
    ///
    /// # Panics
    ///
    /// Panics if the handle was disposed.
    #[must_use]
    pub fn is_cleared(&self, handle: GlobalHandle) -> bool {
        self.handles.is_cleared(handle)
    }

    /// Release a global cell.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already disposed.
    pub fn dispose_global(&mut self, handle: GlobalHandle) {
        let was_strong_root = !self.handles.is_weak(handle) && self.handles.target(handle).is_some();
        self.handles.dispose(handle);
        if was_strong_root {
            self.report_root_relaxed();
        }
    }

    /// Number of registered global cells.
    #[must_use]
    pub fn global_count(&self) -> usize {
        self.handles.len()
    }

    // ------------------------------------------------------------------
    // GC event callbacks
    // ------------------------------------------------------------------

    /// Register a callback invoked at each [`GcEvent`] of every collection.
    pub fn add_gc_callback(&mut self, callback: impl FnMut(GcEvent, &Self) + 'static) {
        self.gc_callbacks.push(Box::new(callback));
    }

    pub(crate) fn dispatch_gc_event(&mut self, event: GcEvent) {
        if self.gc_callbacks.is_empty() {
            return;
        }
        let mut callbacks = std::mem::take(&mut self.gc_callbacks);
        for callback in &mut callbacks {
            callback(event, self);
        }
        self.gc_callbacks = callbacks;
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Check heap consistency.
    ///
    /// # Panics
    ///
    /// Panics on any dangling reference (a slot, global cell, root or
    /// registry entry naming a dead, freed or forwarded cell), a weak
    /// collection whose table is not an ephemeron table, or a table whose
    /// occupancy exceeds its capacity.
    pub fn verify_heap(&self) {
        for (obj, object) in self.space.iter_live() {
            object.visit_slots(|index, target| {
                assert!(
                    self.space.get(target).is_some(),
                    "dangling slot {index} of {obj} -> {target}"
                );
            });
            if let Some(table) = object.collection_table() {
                assert_eq!(
                    self.space.get(table).map(HeapObject::kind),
                    Some(ObjectKind::EphemeronTable),
                    "weak collection {obj} has no table"
                );
            }
            if let Some(table) = object.as_table() {
                assert!(
                    table.number_of_elements() + table.number_of_deleted_elements() <= table.capacity(),
                    "ephemeron table {obj} over capacity"
                );
            }
        }
        for (index, target) in self.handles.strong_roots().chain(self.handles.weak_cells()) {
            assert!(
                self.space.get(target).is_some(),
                "dangling global cell {index} -> {target}"
            );
        }
        for (index, target) in self.roots.iter() {
            assert!(self.space.get(target).is_some(), "dangling root {index} -> {target}");
        }
        for &collection in &self.weak_collections {
            assert_eq!(
                self.space.get(collection).map(HeapObject::kind),
                Some(ObjectKind::WeakCollection),
                "stale weak collection registry entry {collection}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Heap {
        Heap::with_config(HeapConfig {
            region_capacity: 4,
            max_regions: 2,
            ..HeapConfig::default()
        })
    }

    #[test]
    fn test_allocation_fills_regions() {
        let mut heap = small_heap();
        let objs: Vec<_> = (0..8).map(|_| heap.allocate(0)).collect();
        assert_eq!(heap.region_count(), 2);
        assert_eq!(heap.object_count(), 8);
        assert_ne!(heap.region_of(objs[0]), heap.region_of(objs[7]));
        assert!(objs.iter().all(|&o| heap.is_in_young_region(o)));
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut heap = small_heap();
        for _ in 0..8 {
            heap.allocate(0);
        }
        assert_eq!(
            heap.try_allocate(0),
            Err(AllocError::HeapExhausted { max_regions: 2 })
        );
    }

    #[test]
    fn test_free_cells_are_reused() {
        let mut heap = small_heap();
        let objs: Vec<_> = (0..8).map(|_| heap.allocate(0)).collect();
        heap.space.free(objs[1]);
        let again = heap.allocate(0);
        assert_eq!(again, objs[1]);
    }

    #[test]
    fn test_identity_hash_is_stable() {
        let mut heap = Heap::new();
        let obj = heap.allocate(0);
        assert_eq!(heap.existing_identity_hash(obj), None);
        let hash = heap.identity_hash(obj);
        assert_eq!(heap.identity_hash(obj), hash);
        assert!(hash.value() > 0 && hash.value() <= IdentityHash::MASK);
    }

    #[test]
    fn test_slots_and_kinds() {
        let mut heap = Heap::new();
        let a = heap.allocate(2);
        let b = heap.allocate(0);
        heap.set_slot(a, 0, Value::Object(b));
        heap.set_slot(a, 1, Value::Int(3));
        assert_eq!(heap.kind(a), ObjectKind::Plain);
        assert_eq!(heap.slot(a, 0), Value::Object(b));
        assert_eq!(heap.slot(a, 1), Value::Int(3));
        heap.verify_heap();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_slot_out_of_range() {
        let mut heap = Heap::new();
        let a = heap.allocate(1);
        heap.set_slot(a, 1, Value::Int(0));
    }

    #[test]
    fn test_relocation_leaves_forwarding_marker() {
        let mut heap = small_heap();
        let a = heap.allocate(0);
        heap.identity_hash(a);
        heap.space.region_mut(a.region()).unwrap().evacuation_candidate = true;
        let to = heap.space.relocate(a);
        assert_ne!(a.region(), to.region());
        assert_eq!(heap.space.forwarding(a), Some(to));
        assert!(heap.space.get(a).is_none());
        assert!(heap.existing_identity_hash(to).is_some());
    }

    #[test]
    fn test_released_slot_is_reused_with_new_generation() {
        let mut heap = small_heap();
        let a = heap.allocate(0);
        heap.space.region_mut(a.region()).unwrap().evacuation_candidate = true;
        let to = heap.space.relocate(a);
        heap.space.release(a.region());
        assert_eq!(heap.region_count(), 1);

        heap.space.region_mut(to.region()).unwrap().evacuation_candidate = true;
        let back = heap.space.relocate(to);
        assert_eq!(back.region().index(), a.region().index());
        assert_eq!(back.region().generation(), a.region().generation() + 1);
        assert_eq!(heap.space.region_slots(), 2);

        // The old address names the previous occupant of the slot.
        assert_eq!(back.index(), a.index());
        assert!(!heap.contains(a));
        assert!(heap.contains(back));
    }
}
