// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The slot table shared by every map variant: parallel key and value
//! arrays, an occupancy bit array with one `u32` word per 32 slots, a
//! 64-bit hash seed, and a 16-bit generation counter bumped on every
//! structural mutation.

use crate::hash::MapKey;
use allocator_api2::alloc::{AllocError, Allocator};
use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Smallest slot count any table uses. Rehashing is expensive and tiny
/// tables rehash constantly, so start at a size where probing stays cheap.
pub(crate) const MIN_SLOTS: usize = 32;

/// Table length for a requested item capacity: the next power of two above
/// `items + 2`, floored at [MIN_SLOTS].
pub(crate) fn slots_for_items(items: usize) -> usize {
    items
        .saturating_add(2)
        .next_power_of_two()
        .max(MIN_SLOTS)
}

/// Outcome of a probe sequence.
pub(crate) enum Probe {
    /// An occupied slot holding an equal key.
    Existing(usize),
    /// The first vacant slot in the chain (only reported when probing on
    /// behalf of an insert).
    Vacant(usize),
    /// No equal key and, for inserts, no vacancy in the whole table.
    Absent,
}

pub(crate) struct RawTable<K, V> {
    keys: NonNull<K>,
    values: NonNull<V>,
    occupancy: NonNull<u32>,
    slots: usize,
    items: usize,
    seed: u64,
    generation: u16,
    /// Deletions leave holes in probe chains (no tombstones, no
    /// backward-shift). Until the first one, a lookup can stop at a vacant
    /// slot; afterwards it must scan on, because an equal key may sit past
    /// the hole. A rehash builds a hole-free table and clears this.
    saw_deletion: bool,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> RawTable<K, V> {
    fn array_layouts(slots: usize) -> Result<(Layout, Layout, Layout), AllocError> {
        debug_assert!(slots.is_power_of_two() && slots >= MIN_SLOTS);
        let keys = Layout::array::<K>(slots).map_err(|_| AllocError)?;
        let values = Layout::array::<V>(slots).map_err(|_| AllocError)?;
        let occupancy = Layout::array::<u32>(slots / 32).map_err(|_| AllocError)?;
        Ok((keys, values, occupancy))
    }

    /// Allocates a table of exactly `slots` slots (a power of two, at least
    /// [MIN_SLOTS]) with every slot vacant.
    pub(crate) fn new_in<A: Allocator + ?Sized>(
        slots: usize,
        seed: u64,
        allocator: &A,
    ) -> Result<Self, AllocError> {
        let (keys_layout, values_layout, occupancy_layout) = Self::array_layouts(slots)?;

        let keys = allocator.allocate(keys_layout)?.cast::<K>();
        let values = match allocator.allocate(values_layout) {
            Ok(p) => p.cast::<V>(),
            Err(e) => {
                // SAFETY: keys was just allocated with this layout.
                unsafe { allocator.deallocate(keys.cast(), keys_layout) };
                return Err(e);
            }
        };
        let occupancy = match allocator.allocate_zeroed(occupancy_layout) {
            Ok(p) => p.cast::<u32>(),
            Err(e) => {
                // SAFETY: both arrays were just allocated with these layouts.
                unsafe {
                    allocator.deallocate(keys.cast(), keys_layout);
                    allocator.deallocate(values.cast(), values_layout);
                }
                return Err(e);
            }
        };

        Ok(Self {
            keys,
            values,
            occupancy,
            slots,
            items: 0,
            seed,
            generation: 0,
            saw_deletion: false,
            _marker: PhantomData,
        })
    }

    /// Returns the arrays to the allocator that provided them.
    ///
    /// # Safety
    /// `allocator` must be the allocator `new_in` was called with, and the
    /// table must not be used afterwards.
    pub(crate) unsafe fn dealloc_in<A: Allocator + ?Sized>(&self, allocator: &A) {
        // Layouts were constructible at new_in time, so this cannot fail.
        let Ok((keys_layout, values_layout, occupancy_layout)) = Self::array_layouts(self.slots)
        else {
            return;
        };
        // SAFETY: same allocator and layouts as the original allocation.
        unsafe {
            allocator.deallocate(self.keys.cast(), keys_layout);
            allocator.deallocate(self.values.cast(), values_layout);
            allocator.deallocate(self.occupancy.cast(), occupancy_layout);
        }
    }

    #[inline]
    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    pub(crate) fn items(&self) -> usize {
        self.items
    }

    #[inline]
    pub(crate) fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub(crate) fn generation(&self) -> u16 {
        self.generation
    }

    #[inline]
    pub(crate) fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    #[inline]
    pub(crate) fn set_generation(&mut self, generation: u16) {
        self.generation = generation;
    }

    #[inline]
    fn occupancy_word(&self, word: usize) -> u32 {
        debug_assert!(word < self.slots / 32);
        // SAFETY: word index is within the occupancy array.
        unsafe { self.occupancy.as_ptr().add(word).read() }
    }

    #[inline]
    pub(crate) fn is_occupied(&self, slot: usize) -> bool {
        self.occupancy_word(slot >> 5) & (1u32 << (slot & 31)) != 0
    }

    #[inline]
    pub(crate) fn set_occupied(&mut self, slot: usize) {
        // SAFETY: slot >> 5 is within the occupancy array.
        unsafe {
            let word = self.occupancy.as_ptr().add(slot >> 5);
            word.write(word.read() | 1u32 << (slot & 31));
        }
    }

    #[inline]
    pub(crate) fn clear_occupied(&mut self, slot: usize) {
        // SAFETY: slot >> 5 is within the occupancy array.
        unsafe {
            let word = self.occupancy.as_ptr().add(slot >> 5);
            word.write(word.read() & !(1u32 << (slot & 31)));
        }
    }

    /// # Safety
    /// `slot` must be occupied.
    #[inline]
    pub(crate) unsafe fn key_at(&self, slot: usize) -> &K {
        debug_assert!(self.is_occupied(slot));
        // SAFETY: occupied slots hold initialized keys.
        unsafe { &*self.keys.as_ptr().add(slot) }
    }

    /// # Safety
    /// `slot` must be occupied.
    #[inline]
    pub(crate) unsafe fn value_at(&self, slot: usize) -> &V {
        debug_assert!(self.is_occupied(slot));
        // SAFETY: occupied slots hold initialized values.
        unsafe { &*self.values.as_ptr().add(slot) }
    }

    /// # Safety
    /// `slot` must be occupied.
    #[inline]
    pub(crate) unsafe fn value_at_mut(&mut self, slot: usize) -> &mut V {
        debug_assert!(self.is_occupied(slot));
        // SAFETY: occupied slots hold initialized values.
        unsafe { &mut *self.values.as_ptr().add(slot) }
    }

    /// Fills a vacant slot and accounts for it.
    ///
    /// # Safety
    /// `slot` must be vacant and within the table.
    pub(crate) unsafe fn occupy(&mut self, slot: usize, key: K, value: V) {
        debug_assert!(!self.is_occupied(slot));
        // SAFETY: slot indexes are in range; vacant slots may be written
        // without dropping anything.
        unsafe {
            self.keys.as_ptr().add(slot).write(key);
            self.values.as_ptr().add(slot).write(value);
        }
        self.set_occupied(slot);
        self.items += 1;
    }

    /// Clears an occupied slot and accounts for it. The key and value bytes
    /// stay behind; callers own any cleanup of what they pointed to.
    ///
    /// # Safety
    /// `slot` must be occupied.
    pub(crate) unsafe fn vacate(&mut self, slot: usize) {
        debug_assert!(self.is_occupied(slot));
        self.clear_occupied(slot);
        self.items -= 1;
        self.saw_deletion = true;
    }

    /// First occupied slot at or after `from`, skipping 32 vacant slots per
    /// step through the occupancy words.
    pub(crate) fn next_occupied(&self, from: usize) -> Option<usize> {
        let mut slot = from;
        while slot < self.slots {
            let word = slot >> 5;
            let pending = self.occupancy_word(word) >> (slot & 31);
            if pending == 0 {
                slot = (word + 1) << 5;
                continue;
            }
            return Some(slot + pending.trailing_zeros() as usize);
        }
        None
    }
}

impl<K: MapKey + Eq, V> RawTable<K, V> {
    /// Runs the linear probe chain for `key`.
    ///
    /// Starting from `hash & (slots - 1)`, each slot is inspected in turn,
    /// wrapping at the end of the table. An occupied slot with an equal key
    /// ends the probe as [Probe::Existing]. A vacant slot ends it as
    /// [Probe::Vacant] when probing for an insert destination; for a lookup
    /// it ends the chain only while the table has never seen a deletion —
    /// once holes exist, an equal key may live beyond one, and the scan
    /// continues. A full circuit of the table ends as [Probe::Absent].
    ///
    /// Inserts must therefore run a lookup probe first (to catch an equal
    /// key beyond a hole) and only then take the first vacancy; taking the
    /// vacancy blind would duplicate such a key.
    pub(crate) fn probe(&self, key: &K, for_insert: bool) -> Probe {
        let mask = self.slots - 1;
        let mut slot = key.map_hash(self.seed) as usize & mask;
        let mut checked = 0usize;
        loop {
            if self.is_occupied(slot) {
                // SAFETY: just verified the slot is occupied.
                if unsafe { self.key_at(slot) } == key {
                    return Probe::Existing(slot);
                }
            } else if for_insert {
                return Probe::Vacant(slot);
            } else if !self.saw_deletion {
                return Probe::Absent;
            }

            checked += 1;
            if checked == self.slots {
                return Probe::Absent;
            }
            slot = (slot + 1) & mask;
        }
    }
}

/// Resumable iteration state. Unlike [Iter], a cursor does not borrow the
/// map, so the map can be mutated between `next_entry` calls; the recorded
/// generation then makes the cursor yield nothing further, which is the
/// safe answer once slots may have moved.
#[derive(Clone, Copy, Debug)]
pub struct IterCursor {
    pub(crate) slot: usize,
    pub(crate) generation: u16,
}

impl IterCursor {
    pub(crate) fn new(generation: u16) -> Self {
        Self {
            slot: 0,
            generation,
        }
    }
}

/// Borrowing iterator over `(&K, &V)` pairs in slot order.
pub struct Iter<'a, K, V> {
    table: &'a RawTable<K, V>,
    slot: usize,
}

impl<'a, K, V> Iter<'a, K, V> {
    pub(crate) fn new(table: &'a RawTable<K, V>) -> Self {
        Self { table, slot: 0 }
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.table.next_occupied(self.slot)?;
        self.slot = slot + 1;
        // SAFETY: next_occupied only reports occupied slots.
        Some(unsafe { (self.table.key_at(slot), self.table.value_at(slot)) })
    }
}

/// Shared implementation for the cursor-based resumable iteration.
pub(crate) fn cursor_next<'t, K, V>(
    table: &'t RawTable<K, V>,
    cursor: &mut IterCursor,
) -> Option<(&'t K, &'t V)> {
    if cursor.generation != table.generation() {
        return None;
    }
    let slot = table.next_occupied(cursor.slot)?;
    cursor.slot = slot + 1;
    // SAFETY: next_occupied only reports occupied slots.
    Some(unsafe { (table.key_at(slot), table.value_at(slot)) })
}
