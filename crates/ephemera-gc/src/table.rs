//! Open-addressed ephemeron hash table.
//!
//! Entries are keyed by the key object's [`IdentityHash`] and compared by
//! address. Both stay valid across relocation: the hash travels with the
//! object and the collector rewrites key slots when keys move.
//!
//! # Capacity policy
//!
//! - A table never has fewer than [`MIN_CAPACITY`] slots.
//! - An insertion that would make the live count exceed a quarter of the
//!   capacity rebuilds the table first, into the smallest power of two that
//!   keeps `live <= capacity / 4`.
//! - An insertion that would leave fewer than half of the slots empty, counting
//!   tombstones as full, also rebuilds at the capacity the live count calls
//!   for. That rebuild may be smaller than the current table.
//! - Otherwise shrinking happens once per collection (see
//!   [`EphemeronTable::shrink_capacity`]).
//! - Rebuilds copy live entries only, so they reset the tombstone count.

use crate::object::{IdentityHash, ObjectRef, Value};

/// Smallest capacity of any table.
pub const MIN_CAPACITY: usize = 32;

/// Live entries may occupy at most `capacity / MAX_LOAD_DIVISOR` slots.
const MAX_LOAD_DIVISOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Empty,
    Deleted,
    Occupied {
        key: ObjectRef,
        hash: IdentityHash,
        value: Value,
    },
}

/// Capacity and occupancy of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Number of slots.
    pub capacity: usize,
    /// Live entries.
    pub elements: usize,
    /// Tombstones.
    pub deleted: usize,
}

/// Ephemeron table storing `(key, value)` pairs.
#[derive(Debug, Clone)]
pub struct EphemeronTable {
    entries: Box<[Entry]>,
    live: usize,
    deleted: usize,
}

/// Capacity that fits `live` entries under the load bound.
#[must_use]
pub fn capacity_for(live: usize) -> usize {
    (live * MAX_LOAD_DIVISOR).next_power_of_two().max(MIN_CAPACITY)
}

impl Default for EphemeronTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeronTable {
    /// Create an empty table of [`MIN_CAPACITY`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity >= MIN_CAPACITY,
            "invalid ephemeron table capacity {capacity}"
        );
        Self {
            entries: vec![Entry::Empty; capacity].into_boxed_slice(),
            live: 0,
            deleted: 0,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live entries.
    #[must_use]
    pub const fn number_of_elements(&self) -> usize {
        self.live
    }

    /// Number of tombstones.
    #[must_use]
    pub const fn number_of_deleted_elements(&self) -> usize {
        self.deleted
    }

    /// Snapshot of capacity and occupancy.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        TableStats {
            capacity: self.capacity(),
            elements: self.live,
            deleted: self.deleted,
        }
    }

    fn mask(&self) -> usize {
        self.entries.len() - 1
    }

    /// Triangular probe sequence; visits every slot of a power-of-two table.
    fn probe(&self, hash: IdentityHash) -> impl Iterator<Item = usize> {
        let mask = self.mask();
        let first = hash.value() as usize & mask;
        (0..self.entries.len()).map(move |n| (first + n * (n + 1) / 2) & mask)
    }

    /// Slot index of `key`, if present.
    #[must_use]
    pub fn find_entry(&self, key: ObjectRef, hash: IdentityHash) -> Option<usize> {
        for index in self.probe(hash) {
            match self.entries[index] {
                Entry::Empty => return None,
                Entry::Occupied { key: k, .. } if k == key => return Some(index),
                Entry::Occupied { .. } | Entry::Deleted => {}
            }
        }
        None
    }

    /// Value stored for `key`.
    #[must_use]
    pub fn lookup(&self, key: ObjectRef, hash: IdentityHash) -> Option<Value> {
        self.find_entry(key, hash).map(|index| match self.entries[index] {
            Entry::Occupied { value, .. } => value,
            Entry::Empty | Entry::Deleted => unreachable!("find_entry returned a vacant slot"),
        })
    }

    /// Capacity the table must be rebuilt into before `key` can be inserted,
    /// or `None` if the insertion fits in place.
    ///
    /// Growth is driven by the live count alone. A table whose tombstones
    /// would leave less than half of its slots empty is rebuilt at the
    /// capacity its live count calls for, which can be below the current
    /// one.
    #[must_use]
    pub fn rebuild_capacity_for_insert(&self, key: ObjectRef, hash: IdentityHash) -> Option<usize> {
        if self.find_entry(key, hash).is_some() {
            return None;
        }
        let live_after = self.live + 1;
        if live_after > self.capacity() / MAX_LOAD_DIVISOR {
            return Some(capacity_for(live_after));
        }
        if live_after + self.deleted > self.capacity() / 2 {
            return Some(capacity_for(live_after));
        }
        None
    }

    /// Insert or overwrite without resizing.
    ///
    /// Returns the slot index that now holds the entry.
    ///
    /// # Panics
    ///
    /// Panics if the insertion would break the load bound; callers rebuild
    /// first using [`Self::rebuild_capacity_for_insert`].
    pub fn insert(&mut self, key: ObjectRef, hash: IdentityHash, value: Value) -> usize {
        if let Some(index) = self.find_entry(key, hash) {
            if let Entry::Occupied { value: v, .. } = &mut self.entries[index] {
                *v = value;
            }
            return index;
        }
        assert!(
            self.live < self.capacity() / MAX_LOAD_DIVISOR,
            "ephemeron table over capacity: {} live of {}",
            self.live,
            self.capacity()
        );
        let index = self
            .probe(hash)
            .find(|&i| !matches!(self.entries[i], Entry::Occupied { .. }))
            .expect("load bound guarantees a vacant slot");
        if self.entries[index] == Entry::Deleted {
            self.deleted -= 1;
        }
        self.entries[index] = Entry::Occupied { key, hash, value };
        self.live += 1;
        index
    }

    /// Remove `key`, leaving a tombstone. Returns whether it was present.
    pub fn delete(&mut self, key: ObjectRef, hash: IdentityHash) -> bool {
        match self.find_entry(key, hash) {
            Some(index) => {
                self.remove_entry(index);
                true
            }
            None => false,
        }
    }

    /// Turn an occupied slot into a tombstone.
    pub(crate) fn remove_entry(&mut self, index: usize) {
        debug_assert!(matches!(self.entries[index], Entry::Occupied { .. }));
        self.entries[index] = Entry::Deleted;
        self.live -= 1;
        self.deleted += 1;
        debug_assert!(self.live + self.deleted <= self.capacity());
    }

    /// Occupied entries as `(slot index, key, value)`.
    pub fn entries(&self) -> impl Iterator<Item = (usize, ObjectRef, Value)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match *entry {
                Entry::Occupied { key, value, .. } => Some((index, key, value)),
                Entry::Empty | Entry::Deleted => None,
            })
    }

    /// Capacity to shrink to after a collection, if any.
    ///
    /// Shrinks when fewer than a quarter of the slots are live and the
    /// table is above the floor.
    #[must_use]
    pub fn shrink_capacity(&self) -> Option<usize> {
        if self.live >= self.capacity() / MAX_LOAD_DIVISOR || self.capacity() <= MIN_CAPACITY {
            return None;
        }
        let target = capacity_for(self.live);
        (target < self.capacity()).then_some(target)
    }

    /// Copy of this table's live entries rehashed into `capacity` slots.
    #[must_use]
    pub fn rebuilt(&self, capacity: usize) -> Self {
        let mut table = Self::with_capacity(capacity);
        for entry in self.entries.iter() {
            if let Entry::Occupied { key, hash, value } = *entry {
                table.insert(key, hash, value);
            }
        }
        table
    }

    pub(crate) fn read_slot(&self, slot: usize) -> Value {
        match self.entries.get(slot / 2) {
            Some(Entry::Occupied { key, value, .. }) => {
                if slot % 2 == 0 {
                    Value::Object(*key)
                } else {
                    *value
                }
            }
            _ => Value::Undefined,
        }
    }

    pub(crate) fn write_slot(&mut self, slot: usize, new: Value) {
        let Some(Entry::Occupied { key, value, .. }) = self.entries.get_mut(slot / 2) else {
            panic!("write to vacant ephemeron slot {slot}");
        };
        if slot % 2 == 0 {
            let Value::Object(obj) = new else {
                panic!("ephemeron key must be an object, got {new:?}");
            };
            *key = obj;
        } else {
            *value = new;
        }
    }
}
