// Copyright 2026 ktask Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fixed-capacity slot map from small integer ids to shared objects.
//!
//! This is the pid allocator: slot indices are stable for the lifetime of an
//! entry, ids are totally ordered by allocation because a single lock
//! serialises the table, and the table's clone of the object keeps it alive
//! until [`remove`](ObjectTable::remove).

use core::fmt;

use spin::Mutex;

/// A slot index handed out by an [`ObjectTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(usize);

impl ObjectId {
    /// The id of an object that is in no table.
    pub const INVALID: Self = Self(usize::MAX);

    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("<invalid>")
        }
    }
}

/// Fixed-capacity array of shared object references behind one lock.
///
/// `T` is a cheaply clonable handle (in practice `TaskRef`); cloning into
/// the table is what the reference-counting protocol calls taking a
/// reference, and the drop on removal releases it.
pub struct ObjectTable<T, const N: usize> {
    slots: Mutex<[Option<T>; N]>,
}

impl<T: Clone, const N: usize> ObjectTable<T, N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([const { None }; N]),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Stores `object` in the first free slot and returns its id, or `None`
    /// when every slot is taken (the object is dropped in that case).
    pub fn insert(&self, object: T) -> Option<ObjectId> {
        let mut slots = self.slots.lock();
        let free = slots.iter().position(Option::is_none)?;
        slots[free] = Some(object);
        Some(ObjectId::new(free))
    }

    /// Clears `id`'s slot. The removed reference is returned so the caller
    /// drops it outside the table lock.
    pub fn remove(&self, id: ObjectId) -> Option<T> {
        let slot = self.slots.lock().get_mut(id.get())?.take();
        slot
    }

    /// Returns an extra reference to the object in `id`'s slot.
    pub fn lookup(&self, id: ObjectId) -> Option<T> {
        self.slots.lock().get(id.get())?.clone()
    }

    /// The number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every live entry out of the table, returning how many there
    /// were. Used by orderly teardown.
    pub fn drain(&self) -> usize {
        let mut slots = self.slots.lock();
        let mut drained = 0;
        for slot in slots.iter_mut() {
            if slot.take().is_some() {
                drained += 1;
            }
        }
        drained
    }
}

impl<T: Clone, const N: usize> Default for ObjectTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn insert_lookup_remove() {
        let table: ObjectTable<Arc<u32>, 4> = ObjectTable::new();

        let obj = Arc::new(7);
        let id = table.insert(obj.clone()).unwrap();
        assert_eq!(id.get(), 0);
        assert_eq!(Arc::strong_count(&obj), 2);

        let found = table.lookup(id).unwrap();
        assert_eq!(*found, 7);
        assert_eq!(Arc::strong_count(&obj), 3);
        drop(found);

        let removed = table.remove(id).unwrap();
        drop(removed);
        assert_eq!(Arc::strong_count(&obj), 1);
        assert!(table.lookup(id).is_none());
    }

    #[test]
    fn ids_are_allocated_lowest_first_and_reused() {
        let table: ObjectTable<Arc<u32>, 4> = ObjectTable::new();

        let a = table.insert(Arc::new(0)).unwrap();
        let b = table.insert(Arc::new(1)).unwrap();
        let c = table.insert(Arc::new(2)).unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (0, 1, 2));

        table.remove(b);
        let d = table.insert(Arc::new(3)).unwrap();
        assert_eq!(d, b);
        assert_eq!(*table.lookup(d).unwrap(), 3);
    }

    #[test]
    fn exhaustion() {
        let table: ObjectTable<Arc<u32>, 2> = ObjectTable::new();

        table.insert(Arc::new(0)).unwrap();
        table.insert(Arc::new(1)).unwrap();

        let extra = Arc::new(2);
        assert!(table.insert(extra.clone()).is_none());
        // The failed insert did not keep a reference behind.
        assert_eq!(Arc::strong_count(&extra), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn invalid_id() {
        let table: ObjectTable<Arc<u32>, 2> = ObjectTable::new();
        assert!(table.lookup(ObjectId::INVALID).is_none());
        assert!(table.remove(ObjectId::INVALID).is_none());
        assert!(!ObjectId::INVALID.is_valid());
    }

    proptest::proptest! {
        /// A pid allocated to one object is never observed for another
        /// until after its removal, across arbitrary insert/remove
        /// interleavings.
        #[test]
        fn pid_stability(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let table: ObjectTable<Arc<usize>, 8> = ObjectTable::new();
            let mut live: Vec<(ObjectId, Arc<usize>)> = Vec::new();
            let mut counter = 0usize;

            for op in ops {
                match op {
                    0 | 1 => {
                        let obj = Arc::new(counter);
                        counter += 1;
                        if let Some(id) = table.insert(obj.clone()) {
                            live.push((id, obj));
                        }
                    }
                    _ => {
                        if let Some((id, obj)) = live.pop() {
                            let removed = table.remove(id).unwrap();
                            proptest::prop_assert!(Arc::ptr_eq(&removed, &obj));
                        }
                    }
                }

                for (id, obj) in &live {
                    let found = table.lookup(*id).unwrap();
                    proptest::prop_assert!(Arc::ptr_eq(&found, obj));
                }
            }
        }
    }
}
