// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::hash::MapKey;
use crate::table::{cursor_next, slots_for_items, Iter, IterCursor, Probe, RawTable};
use crate::MapError;
use allocator_api2::alloc::Allocator;

/// A flat hash map that claims all of its memory at construction and never
/// grows. Inserting beyond the configured maximum fails; everything else is
/// allocation-free, which makes this the variant to pair with arenas whose
/// lifetime outlives the map.
///
/// The slot table is sized to the next power of two above
/// `max_items + 2` (at least 32 slots), so the load factor at maximum fill
/// stays comfortably below 1 and probe chains stay short. Keys and values
/// are stored by value and must be `Copy`; nothing is dropped on delete.
///
/// The `seed` argument is the hash seed. To resist hash flooding, draw it
/// from the OS random source and rotate it across trust boundaries; zero
/// is acceptable only when the keys cannot be chosen by an adversary.
pub struct FixedMap<K, V, A: Allocator> {
    table: RawTable<K, V>,
    max_items: usize,
    allocator: A,
}

impl<K: MapKey + Eq + Copy, V: Copy, A: Allocator> FixedMap<K, V, A> {
    /// Creates a map able to hold `max_items` entries, allocating every
    /// array it will ever use from `allocator` up front.
    pub fn new_in(max_items: usize, seed: u64, allocator: A) -> Result<Self, MapError> {
        let slots = slots_for_items(max_items);
        let table = RawTable::new_in(slots, seed, &allocator)?;
        Ok(Self {
            table,
            max_items,
            allocator,
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.table.items()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The insertion limit this map was built with.
    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Internal slot count; a power of two.
    pub fn slot_count(&self) -> usize {
        self.table.slots()
    }

    /// Inserts or updates. An update overwrites the value and does not
    /// disturb iteration; a fresh insert is a structural mutation and
    /// invalidates live cursors. Fails with [MapError::CapacityExhausted]
    /// at the maximum, leaving the map untouched.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), MapError> {
        // Update path first, with lookup semantics: an equal key beyond a
        // deletion hole must be found, not shadowed by the hole.
        if let Probe::Existing(slot) = self.table.probe(&key, false) {
            // SAFETY: probe reported this slot occupied.
            unsafe { *self.table.value_at_mut(slot) = value };
            return Ok(());
        }

        if self.table.items() == self.max_items {
            return Err(MapError::CapacityExhausted);
        }
        match self.table.probe(&key, true) {
            Probe::Vacant(slot) => {
                // SAFETY: probe reported this slot vacant.
                unsafe { self.table.occupy(slot, key, value) };
                self.table.bump_generation();
                Ok(())
            }
            // The key was just determined absent, and items < max_items
            // guarantees a vacancy in the power-of-two-sized table.
            Probe::Existing(_) | Probe::Absent => Err(MapError::CapacityExhausted),
        }
    }

    /// Shared lookup giving the slot of an equal key.
    fn find(&self, key: &K) -> Option<usize> {
        match self.table.probe(key, false) {
            Probe::Existing(slot) => Some(slot),
            _ => None,
        }
    }

    /// Borrowed view of the value for `key`. The borrow pins the map, so
    /// the pointer stays valid exactly until the next mutation.
    pub fn get(&self, key: &K) -> Option<&V> {
        // SAFETY: find only returns occupied slots.
        self.find(key).map(|slot| unsafe { self.table.value_at(slot) })
    }

    /// Mutable view of the value for `key`. Writing through it is an
    /// update, not a structural mutation.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.find(key) {
            // SAFETY: find only returns occupied slots.
            Some(slot) => Some(unsafe { self.table.value_at_mut(slot) }),
            None => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Removes `key` if present. Returns whether anything was removed.
    /// Removal clears the occupancy bit without compacting probe chains;
    /// lookups handle the holes (see the probe docs).
    pub fn delete(&mut self, key: &K) -> bool {
        match self.find(key) {
            Some(slot) => {
                // SAFETY: find only returns occupied slots.
                unsafe { self.table.vacate(slot) };
                self.table.bump_generation();
                true
            }
            None => false,
        }
    }

    /// Borrowing iterator over entries in slot order.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.table)
    }

    /// Starts resumable iteration. See [IterCursor] for the invalidation
    /// contract: a cursor outlives borrows, and any structural mutation of
    /// the map makes it yield nothing further.
    pub fn cursor(&self) -> IterCursor {
        IterCursor::new(self.table.generation())
    }

    /// Yields the entry under the cursor and advances it, or `None` at the
    /// end of the table or after a structural mutation invalidated the
    /// cursor.
    pub fn next_entry(&self, cursor: &mut IterCursor) -> Option<(&K, &V)> {
        cursor_next(&self.table, cursor)
    }

    /// Deletes the entry most recently yielded by [Self::next_entry] (or
    /// any other key) while keeping `cursor` alive: the cursor adopts the
    /// post-delete generation, so iteration continues from where it was.
    /// Entries not yet visited keep their slots because deletion never
    /// moves entries.
    pub fn delete_and_resync(&mut self, cursor: &mut IterCursor, key: &K) -> bool {
        let deleted = self.delete(key);
        if deleted {
            cursor.generation = self.table.generation();
        }
        deleted
    }
}

impl<K, V, A: Allocator> Drop for FixedMap<K, V, A> {
    fn drop(&mut self) {
        // SAFETY: dropping; the table is never touched again.
        unsafe { self.table.dealloc_in(&self.allocator) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;
    use libdd_alloc::LinearAllocator;
    use core::alloc::Layout;

    #[test]
    fn test_sizing() {
        let map: FixedMap<u64, u64, Global> = FixedMap::new_in(5, 0, Global).unwrap();
        assert_eq!(32, map.slot_count());

        let map: FixedMap<u64, u64, Global> = FixedMap::new_in(100, 0, Global).unwrap();
        assert_eq!(128, map.slot_count());

        // 126 + 2 == 128 stays at 128; 127 + 2 crosses to 256.
        let map: FixedMap<u64, u64, Global> = FixedMap::new_in(126, 0, Global).unwrap();
        assert_eq!(128, map.slot_count());
        let map: FixedMap<u64, u64, Global> = FixedMap::new_in(127, 0, Global).unwrap();
        assert_eq!(256, map.slot_count());
    }

    #[test]
    fn test_insert_get_update() {
        let mut map = FixedMap::new_in(16, 0xDEADBEEF, Global).unwrap();
        for k in 0u64..16 {
            map.insert(k, k * 10).unwrap();
        }
        assert_eq!(16, map.len());
        for k in 0u64..16 {
            assert_eq!(Some(&(k * 10)), map.get(&k));
        }
        assert_eq!(None, map.get(&99));

        // Updates don't change the count.
        map.insert(3, 777).unwrap();
        assert_eq!(16, map.len());
        assert_eq!(Some(&777), map.get(&3));

        // Write through get_mut.
        *map.get_mut(&3).unwrap() = 778;
        assert_eq!(Some(&778), map.get(&3));
    }

    #[test]
    fn test_capacity_limit() {
        let mut map = FixedMap::new_in(4, 7, Global).unwrap();
        for k in 0u64..4 {
            map.insert(k, k).unwrap();
        }
        assert_eq!(Err(MapError::CapacityExhausted), map.insert(4, 4));
        assert_eq!(4, map.len());
        // Updating an existing key still works at capacity.
        map.insert(2, 99).unwrap();
        assert_eq!(Some(&99), map.get(&2));
    }

    #[test]
    fn test_delete_and_reinsert_cycles() {
        // Saturate a small table, then repeatedly delete and reinsert the
        // same keys. Probe chains must stay coherent across the holes that
        // deletion leaves behind.
        let mut map = FixedMap::new_in(30, 0x5EED, Global).unwrap();
        for k in 0u64..30 {
            map.insert(k, k).unwrap();
        }
        for _round in 0..8 {
            for k in (0u64..30).step_by(3) {
                assert!(map.delete(&k));
                assert_eq!(None, map.get(&k));
            }
            for k in (0u64..30).step_by(3) {
                map.insert(k, k + 1000).unwrap();
            }
            for k in 0u64..30 {
                let expected = if k % 3 == 0 { k + 1000 } else { k };
                assert_eq!(Some(&expected), map.get(&k), "key {k}");
            }
        }
        assert_eq!(30, map.len());
    }

    #[test]
    fn test_update_across_deletion_holes() {
        // 30 items in a 32-slot table: probe chains overlap heavily. Punch
        // holes, then update the survivors; an update that stopped at a
        // hole instead of finding its key would duplicate it and inflate
        // the count.
        let mut map = FixedMap::new_in(30, 0x77, Global).unwrap();
        for k in 0u64..30 {
            map.insert(k, k).unwrap();
        }
        for k in (0u64..30).step_by(2) {
            assert!(map.delete(&k));
        }
        for k in (1u64..30).step_by(2) {
            map.insert(k, k + 500).unwrap();
        }
        assert_eq!(15, map.len());
        for k in (1u64..30).step_by(2) {
            assert_eq!(Some(&(k + 500)), map.get(&k));
        }
    }

    #[test]
    fn test_iterator_visits_each_entry_once() {
        let mut map = FixedMap::new_in(64, 0x1234, Global).unwrap();
        for k in 0u64..40 {
            map.insert(k, k).unwrap();
        }
        map.delete(&7);
        map.delete(&23);

        let mut seen = std::collections::HashSet::new();
        for (k, v) in map.iter() {
            assert_eq!(k, v);
            assert!(seen.insert(*k), "duplicate key {k}");
        }
        assert_eq!(map.len(), seen.len());
        assert!(!seen.contains(&7));
        assert!(!seen.contains(&23));
    }

    #[test]
    fn test_cursor_invalidated_by_mutation() {
        let mut map = FixedMap::new_in(16, 1, Global).unwrap();
        for k in 0u64..8 {
            map.insert(k, k).unwrap();
        }

        let mut cursor = map.cursor();
        assert!(map.next_entry(&mut cursor).is_some());

        // An insert between calls kills the cursor.
        map.insert(100, 100).unwrap();
        assert!(map.next_entry(&mut cursor).is_none());

        // A delete between calls kills it too.
        let mut cursor = map.cursor();
        assert!(map.next_entry(&mut cursor).is_some());
        map.delete(&0);
        assert!(map.next_entry(&mut cursor).is_none());

        // An update is not structural and leaves the cursor alive.
        let mut cursor = map.cursor();
        assert!(map.next_entry(&mut cursor).is_some());
        map.insert(1, 999).unwrap();
        assert!(map.next_entry(&mut cursor).is_some());
    }

    #[test]
    fn test_delete_and_resync_keeps_iterating() {
        let mut map = FixedMap::new_in(32, 3, Global).unwrap();
        for k in 0u64..20 {
            map.insert(k, k).unwrap();
        }

        let mut cursor = map.cursor();
        let mut visited = 0;
        while let Some((&k, _)) = map.next_entry(&mut cursor) {
            visited += 1;
            if k % 4 == 0 {
                assert!(map.delete_and_resync(&mut cursor, &k));
            }
        }
        assert_eq!(20, visited);
        assert_eq!(15, map.len());
    }

    #[test]
    fn test_arena_backed_map() {
        let arena =
            LinearAllocator::new_in(Layout::from_size_align(64 * 1024, 8).unwrap(), Global)
                .unwrap();
        let mut map = FixedMap::new_in(100, 9, &arena).unwrap();
        for k in 0u64..100 {
            map.insert(k, k * 2).unwrap();
        }
        for k in 0u64..100 {
            assert_eq!(Some(&(k * 2)), map.get(&k));
        }
        drop(map); // deallocate into the arena is a no-op, but must not panic
    }

    #[test]
    fn fuzz_against_std_map() {
        use std::collections::HashMap;

        use bolero::TypeGenerator;

        #[derive(Debug, TypeGenerator)]
        enum Op {
            Insert(u16, u32),
            Delete(u16),
            Get(u16),
        }

        bolero::check!()
            .with_type::<(u64, Vec<Op>)>()
            .for_each(|(seed, ops)| {
                let mut map = FixedMap::new_in(512, *seed, Global).unwrap();
                let mut golden: HashMap<u16, u32> = HashMap::new();

                for op in ops {
                    match op {
                        Op::Insert(k, v) => {
                            if golden.len() < 512 || golden.contains_key(k) {
                                map.insert(*k, *v).unwrap();
                                golden.insert(*k, *v);
                            }
                        }
                        Op::Delete(k) => {
                            assert_eq!(golden.remove(k).is_some(), map.delete(k));
                        }
                        Op::Get(k) => {
                            assert_eq!(golden.get(k), map.get(k));
                        }
                    }
                    assert_eq!(golden.len(), map.len());
                }

                let visited = map.iter().count();
                assert_eq!(golden.len(), visited);
            });
    }
}
