// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::hash::MapKey;
use crate::table::{cursor_next, slots_for_items, Iter, IterCursor, Probe, RawTable};
use crate::MapError;
use allocator_api2::alloc::Allocator;

/// A flat hash map that rehashes into a larger table when an insert would
/// push it past its load factor.
///
/// The table length is always a power of two. Before probing, an insert
/// checks `(items + 1) > load_factor * slots`; if so, it builds a table at
/// the next length that restores the load factor, re-inserts every live
/// entry with freshly computed hashes, and releases the old arrays. When
/// the allocator refuses the new table, the old one is untouched and the
/// triggering insert fails — the map stays fully usable.
///
/// Everything else (probing, deletion, iteration, seeding) matches
/// [crate::FixedMap]; see its docs and the crate docs.
pub struct GrowMap<K, V, A: Allocator> {
    table: RawTable<K, V>,
    load_factor: f64,
    allocator: A,
}

impl<K: MapKey + Eq + Copy, V: Copy, A: Allocator> GrowMap<K, V, A> {
    /// Creates a map with room for `initial_items` before the first rehash.
    /// `load_factor` must be in (0, 1) exclusive.
    pub fn new_in(
        initial_items: usize,
        load_factor: f64,
        seed: u64,
        allocator: A,
    ) -> Result<Self, MapError> {
        if !(load_factor > 0.0 && load_factor < 1.0) {
            return Err(MapError::InvalidLoadFactor);
        }
        let slots = slots_for_items(initial_items);
        let table = RawTable::new_in(slots, seed, &allocator)?;
        Ok(Self {
            table,
            load_factor,
            allocator,
        })
    }

    pub fn len(&self) -> usize {
        self.table.items()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Internal slot count; a power of two.
    pub fn slot_count(&self) -> usize {
        self.table.slots()
    }

    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    pub(crate) fn allocator(&self) -> &A {
        &self.allocator
    }

    fn over_load_factor(&self, items: usize, slots: usize) -> bool {
        items as f64 > self.load_factor * slots as f64
    }

    /// Rehashes into a table able to hold `needed` items within the load
    /// factor. On allocation failure nothing changes.
    fn rehash_for(&mut self, needed: usize) -> Result<(), MapError> {
        let mut slots = self.table.slots();
        while self.over_load_factor(needed, slots) {
            slots = slots.checked_mul(2).ok_or(MapError::AllocationFailed)?;
        }

        let mut fresh: RawTable<K, V> = RawTable::new_in(slots, self.table.seed(), &self.allocator)?;

        let mut cursor = 0;
        while let Some(slot) = self.table.next_occupied(cursor) {
            cursor = slot + 1;
            // SAFETY: next_occupied only reports occupied slots.
            let (key, value) = unsafe { (*self.table.key_at(slot), *self.table.value_at(slot)) };
            match fresh.probe(&key, true) {
                Probe::Vacant(dest) => {
                    // SAFETY: probe reported the destination vacant.
                    unsafe { fresh.occupy(dest, key, value) };
                }
                // Unique keys land in vacant slots of a strictly larger
                // empty table; anything else is a bug.
                Probe::Existing(_) | Probe::Absent => unreachable!("rehash into occupied table"),
            }
        }

        // Carry the generation over and bump: a rehash is a structural
        // mutation and every slot may have moved.
        fresh.set_generation(self.table.generation().wrapping_add(1));
        let old = core::mem::replace(&mut self.table, fresh);
        // SAFETY: the old table came from this allocator, and is dropped
        // here without further use.
        unsafe { old.dealloc_in(&self.allocator) };
        Ok(())
    }

    /// Inserts or updates, growing first when the insert would cross the
    /// load factor. Fails only when the allocator does.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), MapError> {
        // Update path first, with lookup semantics (see the probe docs);
        // an update never grows the table, so this comes before sizing.
        if let Probe::Existing(slot) = self.table.probe(&key, false) {
            // SAFETY: probe reported this slot occupied.
            unsafe { *self.table.value_at_mut(slot) = value };
            return Ok(());
        }

        let needed = self.table.items() + 1;
        if self.over_load_factor(needed, self.table.slots()) {
            self.rehash_for(needed)?;
        }

        match self.table.probe(&key, true) {
            Probe::Vacant(slot) => {
                // SAFETY: probe reported this slot vacant.
                unsafe { self.table.occupy(slot, key, value) };
                self.table.bump_generation();
                Ok(())
            }
            // The load factor is below 1, so a vacancy always exists, and
            // the update case was handled above.
            Probe::Existing(_) | Probe::Absent => unreachable!("post-grow probe found no slot"),
        }
    }

    fn find(&self, key: &K) -> Option<usize> {
        match self.table.probe(key, false) {
            Probe::Existing(slot) => Some(slot),
            _ => None,
        }
    }

    /// Borrowed view of the value for `key`; valid until the next mutation
    /// (the borrow checker holds callers to that).
    pub fn get(&self, key: &K) -> Option<&V> {
        // SAFETY: find only returns occupied slots.
        self.find(key).map(|slot| unsafe { self.table.value_at(slot) })
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.find(key) {
            // SAFETY: find only returns occupied slots.
            Some(slot) => Some(unsafe { self.table.value_at_mut(slot) }),
            None => None,
        }
    }

    /// The stored key and value for `key`. The stored key can differ from
    /// the probe key in identity (it is the one the map holds on to), which
    /// matters for callers that manage the keys' backing memory.
    pub fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        // SAFETY: find only returns occupied slots.
        self.find(key)
            .map(|slot| unsafe { (self.table.key_at(slot), self.table.value_at(slot)) })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Removes `key` if present; never shrinks the table.
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

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.table)
    }

    /// See [crate::FixedMap::cursor].
    pub fn cursor(&self) -> IterCursor {
        IterCursor::new(self.table.generation())
    }

    /// See [crate::FixedMap::next_entry].
    pub fn next_entry(&self, cursor: &mut IterCursor) -> Option<(&K, &V)> {
        cursor_next(&self.table, cursor)
    }

    /// See [crate::FixedMap::delete_and_resync].
    pub fn delete_and_resync(&mut self, cursor: &mut IterCursor, key: &K) -> bool {
        let deleted = self.delete(key);
        if deleted {
            cursor.generation = self.table.generation();
        }
        deleted
    }
}

impl<K, V, A: Allocator> Drop for GrowMap<K, V, A> {
    fn drop(&mut self) {
        // SAFETY: dropping; the table is never touched again.
        unsafe { self.table.dealloc_in(&self.allocator) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;
    use libdd_alloc::{ChainAllocator, VirtualAllocator};

    #[test]
    fn test_invalid_load_factor() {
        for lf in [0.0, 1.0, 1.1, -0.5, f64::NAN] {
            let r: Result<GrowMap<u64, u64, Global>, _> = GrowMap::new_in(8, lf, 0, Global);
            assert_eq!(Err(MapError::InvalidLoadFactor), r.map(|_| ()));
        }
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut map = GrowMap::new_in(4, 0.5, 0xFACE, Global).unwrap();
        let initial_slots = map.slot_count();

        for k in 0u64..34 {
            map.insert(k, k).unwrap();
        }

        assert_eq!(34, map.len());
        let grown_slots = map.slot_count();
        assert!(grown_slots > initial_slots);
        assert!(grown_slots.is_power_of_two());
        for k in 0u64..34 {
            assert_eq!(Some(&k), map.get(&k), "key {k} lost across rehash");
        }
    }

    #[test]
    fn test_growth_factor_respected() {
        let mut map = GrowMap::new_in(4, 0.5, 1, Global).unwrap();
        for k in 0u64..1000 {
            map.insert(k, k).unwrap();
            // items never exceeds load_factor * slots
            assert!(map.len() as f64 <= 0.5 * map.slot_count() as f64);
        }
    }

    #[test]
    fn test_update_does_not_grow() {
        let mut map = GrowMap::new_in(4, 0.5, 2, Global).unwrap();
        for k in 0u64..16 {
            map.insert(k, k).unwrap();
        }
        let slots = map.slot_count();
        for _ in 0..100 {
            map.insert(7, 7).unwrap();
        }
        assert_eq!(slots, map.slot_count());
    }

    #[test]
    fn test_rehash_invalidates_cursor() {
        let mut map = GrowMap::new_in(4, 0.5, 3, Global).unwrap();
        for k in 0u64..10 {
            map.insert(k, k).unwrap();
        }
        let mut cursor = map.cursor();
        assert!(map.next_entry(&mut cursor).is_some());

        // Push it over the load factor; the rehash moves entries, so the
        // cursor must go dead rather than repeat or skip entries.
        for k in 100u64..140 {
            map.insert(k, k).unwrap();
        }
        assert!(map.next_entry(&mut cursor).is_none());
    }

    #[test]
    fn test_chain_arena_backing() {
        let arena = ChainAllocator::new_in(1 << 20, VirtualAllocator);
        let mut map = GrowMap::new_in(8, 0.75, 4, &arena).unwrap();
        for k in 0u64..5000 {
            map.insert(k, k * 3).unwrap();
        }
        assert_eq!(5000, map.len());
        for k in (0u64..5000).step_by(7) {
            assert_eq!(Some(&(k * 3)), map.get(&k));
        }
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
                let mut map = GrowMap::new_in(2, 0.7, *seed, Global).unwrap();
                let mut golden: HashMap<u16, u32> = HashMap::new();

                for op in ops {
                    match op {
                        Op::Insert(k, v) => {
                            map.insert(*k, *v).unwrap();
                            golden.insert(*k, *v);
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

                let mut count = 0;
                for (k, v) in map.iter() {
                    assert_eq!(golden.get(k), Some(v));
                    count += 1;
                }
                assert_eq!(golden.len(), count);
            });
    }
}
