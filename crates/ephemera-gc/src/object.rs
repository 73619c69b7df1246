//! Heap object representation.
//!
//! Every heap cell holds a [`HeapObject`]: a small header (tri-color mark and
//! lazily assigned identity hash) followed by a body whose reference slots
//! the collector can enumerate. Slot indices are uniform across kinds so the
//! remembered set can address any reference field as `(holder, index)`:
//!
//! | Kind               | Slot layout                                   |
//! |--------------------|-----------------------------------------------|
//! | `Plain`            | `0..N` strong slots                           |
//! | `WeakCollection`   | `0` is the strong table slot                  |
//! | `EphemeronTable`   | `2 * i` is entry `i`'s key, `2 * i + 1` value  |

use std::fmt;

use crate::table::EphemeronTable;

/// Identifier of a region (the unit of allocation and evacuation).
///
/// Region table slots are reused once a region is released; the generation
/// tells the occupants of one slot apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId {
    index: u32,
    generation: u32,
}

impl RegionId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Index of this region in the heap's region table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// How many regions occupied this table slot before this one.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    pub(crate) const fn next_generation(self) -> Self {
        Self::new(self.index, self.generation.wrapping_add(1))
    }
}

/// Address of a heap cell.
///
/// An `ObjectRef` is only stable until the next collection that relocates
/// the object it names. Hold a [`GlobalHandle`](crate::GlobalHandle) or a
/// shadow-stack root to keep a durable reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    region: RegionId,
    index: u32,
}

impl ObjectRef {
    pub(crate) const fn new(region: RegionId, index: u32) -> Self {
        Self { region, index }
    }

    /// Region this address belongs to.
    #[must_use]
    pub const fn region(self) -> RegionId {
        self.region
    }

    /// Cell index within the region.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.region.index, self.index)
    }
}

/// Address-independent identity of an object.
///
/// Assigned on first request and never changed afterwards, so it survives
/// relocation and can key hash tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityHash(u32);

impl IdentityHash {
    /// Largest hash value (hashes fit in 30 bits).
    pub const MASK: u32 = (1 << 30) - 1;

    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw hash value.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// Contents of a reference slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Value {
    /// Empty slot.
    #[default]
    Undefined,
    /// Immediate integer. Never traced and never relocated.
    Int(i64),
    /// Reference to a heap object.
    Object(ObjectRef),
}

impl Value {
    /// The referenced object, if this value is a reference.
    #[must_use]
    pub const fn as_object(self) -> Option<ObjectRef> {
        match self {
            Self::Object(obj) => Some(obj),
            Self::Undefined | Self::Int(_) => None,
        }
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Self::Object(obj)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

/// Tri-color marking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    /// Not (yet) discovered in the current cycle.
    #[default]
    White,
    /// Discovered, waiting in the work queue to be scanned.
    Grey,
    /// Fully scanned.
    Black,
}

impl Color {
    /// Whether the object has been discovered this cycle.
    #[must_use]
    pub const fn is_marked(self) -> bool {
        !matches!(self, Self::White)
    }
}

/// Kind of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Ordinary object with strong slots.
    Plain,
    /// Client-visible weak map wrapping one ephemeron table.
    WeakCollection,
    /// Backing store of a weak collection.
    EphemeronTable,
}

#[derive(Debug)]
pub(crate) enum ObjectBody {
    Plain(Vec<Value>),
    WeakCollection { table: ObjectRef },
    Table(EphemeronTable),
}

#[derive(Debug)]
pub(crate) struct HeapObject {
    pub(crate) color: Color,
    hash: Option<IdentityHash>,
    pub(crate) body: ObjectBody,
}

impl HeapObject {
    pub(crate) const fn new(body: ObjectBody, color: Color) -> Self {
        Self {
            color,
            hash: None,
            body,
        }
    }

    pub(crate) const fn kind(&self) -> ObjectKind {
        match self.body {
            ObjectBody::Plain(_) => ObjectKind::Plain,
            ObjectBody::WeakCollection { .. } => ObjectKind::WeakCollection,
            ObjectBody::Table(_) => ObjectKind::EphemeronTable,
        }
    }

    pub(crate) const fn identity_hash(&self) -> Option<IdentityHash> {
        self.hash
    }

    /// # Panics
    ///
    /// Panics if a hash was already assigned.
    pub(crate) fn assign_identity_hash(&mut self, hash: IdentityHash) {
        assert!(
            self.hash.is_none(),
            "identity hash reassigned ({:?} -> {hash:?})",
            self.hash
        );
        self.hash = Some(hash);
    }

    pub(crate) fn slot_count(&self) -> usize {
        match &self.body {
            ObjectBody::Plain(slots) => slots.len(),
            ObjectBody::WeakCollection { .. } => 1,
            ObjectBody::Table(table) => table.capacity() * 2,
        }
    }

    pub(crate) fn read_slot(&self, index: usize) -> Value {
        match &self.body {
            ObjectBody::Plain(slots) => slots.get(index).copied().unwrap_or_default(),
            ObjectBody::WeakCollection { table } => {
                if index == 0 {
                    Value::Object(*table)
                } else {
                    Value::Undefined
                }
            }
            ObjectBody::Table(table) => table.read_slot(index),
        }
    }

    /// Overwrite a slot in place.
    ///
    /// For tables only occupied key/value slots may be rewritten (this is
    /// how relocation re-points entries); keys must stay objects.
    pub(crate) fn write_slot(&mut self, index: usize, value: Value) {
        match &mut self.body {
            ObjectBody::Plain(slots) => slots[index] = value,
            ObjectBody::WeakCollection { table } => {
                let Value::Object(obj) = value else {
                    panic!("weak collection table slot must hold an object, got {value:?}");
                };
                assert_eq!(index, 0, "weak collection has a single slot");
                *table = obj;
            }
            ObjectBody::Table(table) => table.write_slot(index, value),
        }
    }

    pub(crate) fn visit_slots(&self, mut f: impl FnMut(usize, ObjectRef)) {
        match &self.body {
            ObjectBody::Plain(slots) => {
                for (index, value) in slots.iter().enumerate() {
                    if let Value::Object(obj) = value {
                        f(index, *obj);
                    }
                }
            }
            ObjectBody::WeakCollection { table } => f(0, *table),
            ObjectBody::Table(table) => {
                for (entry, key, value) in table.entries() {
                    f(entry * 2, key);
                    if let Value::Object(obj) = value {
                        f(entry * 2 + 1, obj);
                    }
                }
            }
        }
    }

    pub(crate) const fn as_table(&self) -> Option<&EphemeronTable> {
        match &self.body {
            ObjectBody::Table(table) => Some(table),
            _ => None,
        }
    }

    pub(crate) fn as_table_mut(&mut self) -> Option<&mut EphemeronTable> {
        match &mut self.body {
            ObjectBody::Table(table) => Some(table),
            _ => None,
        }
    }

    pub(crate) const fn collection_table(&self) -> Option<ObjectRef> {
        match self.body {
            ObjectBody::WeakCollection { table } => Some(table),
            _ => None,
        }
    }
}
