//! Client operations on weak collections.
//!
//! A weak collection is a heap object holding a single strong reference to
//! its [`EphemeronTable`]. The table is replaced wholesale when it grows or
//! shrinks, so client code names the collection, never the table.

use crate::gc::{marker, weak};
use crate::heap::Heap;
use crate::object::{ObjectBody, ObjectKind, ObjectRef, Value};
use crate::table::{EphemeronTable, TableStats};

impl Heap {
    /// Allocate an empty weak collection.
    ///
    /// # Panics
    ///
    /// Panics when the heap is exhausted.
    pub fn create_weak_collection(&mut self) -> ObjectRef {
        let table = self
            .allocate_body(ObjectBody::Table(EphemeronTable::new()))
            .unwrap_or_else(|e| panic!("fatal allocation failure: {e}"));
        let collection = self
            .allocate_body(ObjectBody::WeakCollection { table })
            .unwrap_or_else(|e| panic!("fatal allocation failure: {e}"));
        marker::write_barrier(self, collection, 0, table);
        self.weak_collections.push(collection);
        collection
    }

    fn table_ref(&self, collection: ObjectRef) -> ObjectRef {
        let object = self.object(collection);
        assert_eq!(
            object.kind(),
            ObjectKind::WeakCollection,
            "{collection} is not a weak collection"
        );
        object
            .collection_table()
            .expect("weak collection holds a table")
    }

    fn table(&self, collection: ObjectRef) -> &EphemeronTable {
        let table = self.table_ref(collection);
        self.object(table)
            .as_table()
            .expect("weak collection table is an ephemeron table")
    }

    /// Map `key` to `value`, growing the table if needed.
    ///
    /// The key is assigned an identity hash if it has none.
    ///
    /// # Panics
    ///
    /// Panics if `collection` is not a live weak collection, `key` or the
    /// referenced value is dead, or the heap is exhausted.
    pub fn weak_collection_set(&mut self, collection: ObjectRef, key: ObjectRef, value: Value) {
        let mut table_ref = self.table_ref(collection);
        assert!(self.contains(key), "weak collection key {key} is dead");
        if let Value::Object(target) = value {
            assert!(self.contains(target), "weak collection value {target} is dead");
        }
        let hash = self.identity_hash(key);

        let rebuilt = {
            let table = self.table(collection);
            table
                .rebuild_capacity_for_insert(key, hash)
                .map(|capacity| table.rebuilt(capacity))
        };
        if let Some(table) = rebuilt {
            weak::replace_table(self, collection, table_ref, table);
            table_ref = self.table_ref(collection);
        }

        let index = self
            .object_mut(table_ref)
            .as_table_mut()
            .expect("weak collection table is an ephemeron table")
            .insert(key, hash, value);
        marker::write_barrier(self, table_ref, index * 2, key);
        if let Value::Object(target) = value {
            marker::write_barrier(self, table_ref, index * 2 + 1, target);
        }
    }

    /// Value stored for `key`.
    ///
    /// # Panics
    ///
    /// Panics if `collection` is not a live weak collection.
    #[must_use]
    pub fn weak_collection_get(&self, collection: ObjectRef, key: ObjectRef) -> Option<Value> {
        let table = self.table(collection);
        let hash = self.existing_identity_hash(key)?;
        table.lookup(key, hash)
    }

    /// Whether `key` has an entry.
    ///
    /// # Panics
    ///
    /// Panics if `collection` is not a live weak collection.
    #[must_use]
    pub fn weak_collection_has(&self, collection: ObjectRef, key: ObjectRef) -> bool {
        self.weak_collection_get(collection, key).is_some()
    }

    /// Remove `key`, leaving a tombstone. Returns whether it was present.
    ///
    /// # Panics
    ///
    /// Panics if `collection` is not a live weak collection.
    pub fn weak_collection_delete(&mut self, collection: ObjectRef, key: ObjectRef) -> bool {
        let table_ref = self.table_ref(collection);
        let Some(hash) = self.existing_identity_hash(key) else {
            return false;
        };
        self.object_mut(table_ref)
            .as_table_mut()
            .expect("weak collection table is an ephemeron table")
            .delete(key, hash)
    }

    /// Capacity and occupancy of a collection's table.
    ///
    /// # Panics
    ///
    /// Panics if `collection` is not a live weak collection.
    #[must_use]
    pub fn table_stats(&self, collection: ObjectRef) -> TableStats {
        self.table(collection).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let mut heap = Heap::new();
        let map = heap.create_weak_collection();
        let key = heap.allocate(0);
        let value = heap.allocate(0);

        assert_eq!(heap.weak_collection_get(map, key), None);
        heap.weak_collection_set(map, key, Value::Object(value));
        assert_eq!(heap.weak_collection_get(map, key), Some(Value::Object(value)));
        assert!(heap.weak_collection_has(map, key));

        heap.weak_collection_set(map, key, Value::Int(5));
        assert_eq!(heap.weak_collection_get(map, key), Some(Value::Int(5)));
        assert_eq!(heap.table_stats(map).elements, 1);

        assert!(heap.weak_collection_delete(map, key));
        assert!(!heap.weak_collection_delete(map, key));
        assert_eq!(
            heap.table_stats(map),
            TableStats {
                capacity: 32,
                elements: 0,
                deleted: 1
            }
        );
        heap.verify_heap();
    }

    #[test]
    fn test_growth_replaces_table() {
        let mut heap = Heap::new();
        let map = heap.create_weak_collection();
        let first_table = heap.table_ref(map);
        let keys: Vec<_> = (0..9).map(|_| heap.allocate(0)).collect();
        for (n, &key) in keys.iter().enumerate() {
            heap.weak_collection_set(map, key, Value::Int(n as i64));
        }
        assert_eq!(heap.table_stats(map).capacity, 64);
        assert_ne!(heap.table_ref(map), first_table);
        for (n, &key) in keys.iter().enumerate() {
            assert_eq!(heap.weak_collection_get(map, key), Some(Value::Int(n as i64)));
        }
        heap.verify_heap();
    }

    #[test]
    #[should_panic(expected = "is not a weak collection")]
    fn test_plain_object_is_not_a_collection() {
        let mut heap = Heap::new();
        let plain = heap.allocate(0);
        let key = heap.allocate(0);
        heap.weak_collection_set(plain, key, Value::Int(1));
    }
}
