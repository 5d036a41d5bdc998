// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::strmap::{copy_into, free_copy, RawBytes, StrSource};
use crate::{GrowMap, MapError};
use allocator_api2::alloc::Allocator;
use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

/// One value under a key, allocated from the map's allocator and linked in
/// insertion order.
struct ValueNode {
    value: RawBytes,
    value_copied: bool,
    next: *mut ValueNode,
}

#[derive(Clone, Copy)]
struct MultiEntry {
    key_copied: bool,
    head: *mut ValueNode,
    tail: *mut ValueNode,
    count: usize,
}

/// A byte-string multimap: each key holds a list of values in insertion
/// order, and duplicate values under one key are kept and counted
/// separately.
///
/// Keys live in the same flat table as [crate::StrMap]; the values hang off
/// each key entry as an intrusive singly linked list of nodes from the
/// map's allocator. Removing the last value of a key removes the key
/// entry itself.
///
/// Ownership tags work per side exactly as in [StrSource].
pub struct StrMultimap<'s, A: Allocator> {
    inner: GrowMap<RawBytes, MultiEntry, A>,
    _source: PhantomData<&'s [u8]>,
}

impl<'s, A: Allocator> StrMultimap<'s, A> {
    /// See [crate::StrMap::new_in]; the parameters are the same.
    pub fn new_in(
        initial_items: usize,
        load_factor: f64,
        seed: u64,
        allocator: A,
    ) -> Result<Self, MapError> {
        Ok(Self {
            inner: GrowMap::new_in(initial_items, load_factor, seed, allocator)?,
            _source: PhantomData,
        })
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Allocates and fills a value node.
    fn new_node(&self, value: StrSource<'s, '_>) -> Result<*mut ValueNode, MapError> {
        let allocator = self.inner.allocator();
        let (value_raw, value_copied) = match value {
            StrSource::Borrowed(b) => (RawBytes::from_slice(b), false),
            StrSource::Copied(b) => (copy_into(allocator, b)?, true),
        };

        let node = match allocator.allocate(Layout::new::<ValueNode>()) {
            Ok(p) => p.cast::<ValueNode>().as_ptr(),
            Err(e) => {
                if value_copied {
                    // SAFETY: the fresh copy never became reachable.
                    unsafe { free_copy(allocator, value_raw) };
                }
                return Err(e.into());
            }
        };
        // SAFETY: freshly allocated with the node's layout.
        unsafe {
            node.write(ValueNode {
                value: value_raw,
                value_copied,
                next: ptr::null_mut(),
            });
        }
        Ok(node)
    }

    /// # Safety
    /// `node` must have come from [Self::new_node] and be unlinked.
    unsafe fn free_node(&self, node: *mut ValueNode) {
        let allocator = self.inner.allocator();
        // SAFETY: node is live per the contract; read does not drop.
        let owned = unsafe { node.read() };
        if owned.value_copied {
            // SAFETY: the copy belongs to this allocator and is unreachable.
            unsafe { free_copy(allocator, owned.value) };
        }
        // SAFETY: same layout it was allocated with.
        unsafe {
            allocator.deallocate(NonNull::new_unchecked(node.cast()), Layout::new::<ValueNode>())
        };
    }

    /// Appends `value` to `key`'s list, creating the key entry if this is
    /// its first value.
    pub fn insert(
        &mut self,
        key: StrSource<'s, '_>,
        value: StrSource<'s, '_>,
    ) -> Result<(), MapError> {
        let probe = RawBytes::from_slice(match &key {
            StrSource::Borrowed(b) => b,
            StrSource::Copied(b) => b,
        });

        if self.inner.contains_key(&probe) {
            let node = self.new_node(value)?;
            // Found above; the node allocation did not touch the table.
            if let Some(entry) = self.inner.get_mut(&probe) {
                // SAFETY: tail of a non-empty list is a live node.
                unsafe { (*entry.tail).next = node };
                entry.tail = node;
                entry.count += 1;
            }
            return Ok(());
        }

        let allocator = self.inner.allocator();
        let (key_raw, key_copied) = match &key {
            StrSource::Borrowed(b) => (RawBytes::from_slice(b), false),
            StrSource::Copied(b) => (copy_into(allocator, b)?, true),
        };
        let node = match self.new_node(value) {
            Ok(node) => node,
            Err(e) => {
                if key_copied {
                    // SAFETY: the fresh key copy never became reachable.
                    unsafe { free_copy(self.inner.allocator(), key_raw) };
                }
                return Err(e);
            }
        };
        let entry = MultiEntry {
            key_copied,
            head: node,
            tail: node,
            count: 1,
        };
        if let Err(e) = self.inner.insert(key_raw, entry) {
            // SAFETY: neither the node nor the key copy became reachable.
            unsafe {
                self.free_node(node);
                if key_copied {
                    free_copy(self.inner.allocator(), key_raw);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Number of values stored under `key`; zero when the key is absent.
    pub fn value_count(&self, key: &[u8]) -> usize {
        self.inner
            .get(&RawBytes::from_slice(key))
            .map_or(0, |entry| entry.count)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.contains_key(&RawBytes::from_slice(key))
    }

    /// Removes the first value under `key` whose bytes equal `value`.
    /// Removing the last value removes the key entry. Returns whether a
    /// value was removed.
    pub fn delete_value(&mut self, key: &[u8], value: &[u8]) -> bool {
        let probe = RawBytes::from_slice(key);

        let mut unlinked: *mut ValueNode = ptr::null_mut();
        let mut now_empty = false;
        if let Some(entry) = self.inner.get_mut(&probe) {
            // SAFETY: list nodes are live until unlinked here.
            unsafe {
                let mut prev: *mut ValueNode = ptr::null_mut();
                let mut node = entry.head;
                while !node.is_null() {
                    if (*node).value.as_slice() == value {
                        if prev.is_null() {
                            entry.head = (*node).next;
                        } else {
                            (*prev).next = (*node).next;
                        }
                        if entry.tail == node {
                            entry.tail = prev;
                        }
                        entry.count -= 1;
                        unlinked = node;
                        break;
                    }
                    prev = node;
                    node = (*node).next;
                }
                now_empty = entry.head.is_null();
            }
        }

        if unlinked.is_null() {
            return false;
        }
        // SAFETY: the node was unlinked above and is never reachable again.
        unsafe { self.free_node(unlinked) };

        if now_empty {
            self.remove_key_entry(&probe);
        }
        true
    }

    /// Removes `key` and its whole value list. Returns whether the key was
    /// present.
    pub fn delete_key(&mut self, key: &[u8]) -> bool {
        let probe = RawBytes::from_slice(key);
        let Some(entry) = self.inner.get(&probe) else {
            return false;
        };
        let mut node = entry.head;
        while !node.is_null() {
            // SAFETY: walking a live list; each node is freed exactly once
            // after its next pointer is read out.
            unsafe {
                let next = (*node).next;
                self.free_node(node);
                node = next;
            }
        }
        self.remove_key_entry(&probe);
        true
    }

    /// Drops the (already emptied) key entry and its key-copy bytes.
    fn remove_key_entry(&mut self, probe: &RawBytes) {
        let Some((&stored_key, &entry)) = self.inner.get_key_value(probe) else {
            return;
        };
        let removed = self.inner.delete(probe);
        debug_assert!(removed);
        if entry.key_copied {
            // SAFETY: the entry is out of the table; no readers remain.
            unsafe { free_copy(self.inner.allocator(), stored_key) };
        }
    }

    /// Iterates the values of one key in insertion order.
    pub fn values<'m>(&'m self, key: &[u8]) -> ValueIter<'m> {
        let node = self
            .inner
            .get(&RawBytes::from_slice(key))
            .map_or(ptr::null(), |entry| entry.head.cast_const());
        ValueIter {
            node,
            _map: PhantomData,
        }
    }

    /// Iterates every `(key, value)` pair: keys in slot order, values in
    /// insertion order within their key, so one key's values always come
    /// out adjacent.
    pub fn iter<'m>(&'m self) -> PairIter<'m> {
        PairIter {
            entries: self.inner.iter(),
            key: RawBytes::from_slice(&[]),
            node: ptr::null(),
            _map: PhantomData,
        }
    }
}

impl<A: Allocator> Drop for StrMultimap<'_, A> {
    fn drop(&mut self) {
        for (key, entry) in self.inner.iter() {
            let mut node = entry.head;
            while !node.is_null() {
                // SAFETY: final walk; each node freed once.
                unsafe {
                    let next = (*node).next;
                    self.free_node(node);
                    node = next;
                }
            }
            if entry.key_copied {
                // SAFETY: drop is the last reader of the key copy.
                unsafe { free_copy(self.inner.allocator(), *key) };
            }
        }
    }
}

/// Iterator over one key's values. See [StrMultimap::values].
pub struct ValueIter<'m> {
    node: *const ValueNode,
    _map: PhantomData<&'m ()>,
}

impl<'m> Iterator for ValueIter<'m> {
    type Item = &'m [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() {
            return None;
        }
        // SAFETY: nodes stay live for the map borrow 'm.
        unsafe {
            let value = (*self.node).value.as_slice();
            self.node = (*self.node).next;
            Some(value)
        }
    }
}

/// Iterator over every pair. See [StrMultimap::iter].
pub struct PairIter<'m> {
    entries: crate::table::Iter<'m, RawBytes, MultiEntry>,
    key: RawBytes,
    node: *const ValueNode,
    _map: PhantomData<&'m ()>,
}

impl<'m> Iterator for PairIter<'m> {
    type Item = (&'m [u8], &'m [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.node.is_null() {
            let (key, entry) = self.entries.next()?;
            self.key = *key;
            self.node = entry.head.cast_const();
        }
        // SAFETY: stored views and nodes stay live for the map borrow 'm.
        unsafe {
            let value = (*self.node).value.as_slice();
            self.node = (*self.node).next;
            Some((self.key.as_slice(), value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;
    use libdd_alloc::{ChainAllocator, VirtualAllocator};

    fn new_map<'s>() -> StrMultimap<'s, Global> {
        StrMultimap::new_in(8, 0.5, 0xBEE5, Global).unwrap()
    }

    #[test]
    fn test_insert_and_counts() {
        let mut map = new_map();
        map.insert(StrSource::Borrowed(b"key1"), StrSource::Borrowed(b"one"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"key1"), StrSource::Borrowed(b"two"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"key2"), StrSource::Borrowed(b"three"))
            .unwrap();

        assert_eq!(2, map.key_count());
        assert_eq!(2, map.value_count(b"key1"));
        assert_eq!(1, map.value_count(b"key2"));
        assert_eq!(0, map.value_count(b"missing"));
    }

    #[test]
    fn test_per_key_iteration_order() {
        let mut map = new_map();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Borrowed(b"A"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Borrowed(b"B"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"other"), StrSource::Borrowed(b"C"))
            .unwrap();

        let values: Vec<&[u8]> = map.values(b"k").collect();
        assert_eq!(vec![&b"A"[..], &b"B"[..]], values);

        // All pairs: three entries, with k's two values adjacent and in
        // insertion order.
        let pairs: Vec<(&[u8], &[u8])> = map.iter().collect();
        assert_eq!(3, pairs.len());
        let k_positions: Vec<usize> = pairs
            .iter()
            .enumerate()
            .filter(|(_, (k, _))| *k == b"k")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(2, k_positions.len());
        assert_eq!(k_positions[0] + 1, k_positions[1]);
        assert_eq!(b"A", pairs[k_positions[0]].1);
        assert_eq!(b"B", pairs[k_positions[1]].1);
    }

    #[test]
    fn test_duplicate_values_counted_separately() {
        let mut map = new_map();
        for _ in 0..2 {
            map.insert(StrSource::Borrowed(b"dup"), StrSource::Borrowed(b"same"))
                .unwrap();
        }
        map.insert(StrSource::Borrowed(b"dup"), StrSource::Borrowed(b"unique"))
            .unwrap();
        assert_eq!(3, map.value_count(b"dup"));

        let values: Vec<&[u8]> = map.values(b"dup").collect();
        assert_eq!(vec![&b"same"[..], &b"same"[..], &b"unique"[..]], values);
    }

    #[test]
    fn test_delete_value() {
        let mut map = new_map();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Copied(b"v1"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Copied(b"v2"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Copied(b"v1"))
            .unwrap();

        // Removes only the first matching node.
        assert!(map.delete_value(b"k", b"v1"));
        assert_eq!(2, map.value_count(b"k"));
        let values: Vec<&[u8]> = map.values(b"k").collect();
        assert_eq!(vec![&b"v2"[..], &b"v1"[..]], values);

        assert!(!map.delete_value(b"k", b"gone"));
        assert!(!map.delete_value(b"absent", b"v1"));

        // Emptying the list removes the key entry.
        assert!(map.delete_value(b"k", b"v2"));
        assert!(map.delete_value(b"k", b"v1"));
        assert_eq!(0, map.key_count());
        assert!(!map.contains_key(b"k"));
    }

    #[test]
    fn test_delete_value_fixes_tail_appends() {
        let mut map = new_map();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Borrowed(b"a"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Borrowed(b"b"))
            .unwrap();
        // Remove the tail, then append: the new value must land at the end,
        // not vanish behind a stale tail pointer.
        assert!(map.delete_value(b"k", b"b"));
        map.insert(StrSource::Borrowed(b"k"), StrSource::Borrowed(b"c"))
            .unwrap();
        let values: Vec<&[u8]> = map.values(b"k").collect();
        assert_eq!(vec![&b"a"[..], &b"c"[..]], values);
    }

    #[test]
    fn test_delete_key() {
        let mut map = new_map();
        map.insert(StrSource::Copied(b"k"), StrSource::Copied(b"v1"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"k"), StrSource::Copied(b"v2"))
            .unwrap();
        map.insert(StrSource::Borrowed(b"stay"), StrSource::Borrowed(b"v"))
            .unwrap();

        assert!(map.delete_key(b"k"));
        assert!(!map.delete_key(b"k"));
        assert_eq!(1, map.key_count());
        assert_eq!(0, map.value_count(b"k"));
        assert_eq!(1, map.value_count(b"stay"));
    }

    #[test]
    fn test_copied_values_survive_source_mutation() {
        let mut map = new_map();
        let mut buf = *b"volatile";
        map.insert(StrSource::Borrowed(b"k"), StrSource::Copied(&buf))
            .unwrap();
        buf.fill(b'?');
        let values: Vec<&[u8]> = map.values(b"k").collect();
        assert_eq!(vec![&b"volatile"[..]], values);
    }

    #[test]
    fn test_arena_backed() {
        let arena = ChainAllocator::new_in(1 << 16, VirtualAllocator);
        let mut map = StrMultimap::new_in(8, 0.7, 2, &arena).unwrap();
        for i in 0..100u32 {
            let key = format!("key-{}", i % 10);
            let value = format!("value-{i}");
            map.insert(
                StrSource::Copied(key.as_bytes()),
                StrSource::Copied(value.as_bytes()),
            )
            .unwrap();
        }
        assert_eq!(10, map.key_count());
        for i in 0..10 {
            let key = format!("key-{i}");
            assert_eq!(10, map.value_count(key.as_bytes()));
        }
    }

    #[test]
    fn fuzz_against_std_model() {
        use std::collections::HashMap;

        bolero::check!()
            .with_type::<(u64, Vec<(u8, Vec<u8>, bool)>)>()
            .for_each(|(seed, ops)| {
                let mut map = StrMultimap::new_in(4, 0.6, *seed, Global).unwrap();
                let mut golden: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();

                for (key_byte, value, delete) in ops {
                    let key = vec![*key_byte];
                    if *delete {
                        let expect = match golden.get_mut(&key) {
                            Some(list) => {
                                match list.iter().position(|v| v == value) {
                                    Some(at) => {
                                        list.remove(at);
                                        if list.is_empty() {
                                            golden.remove(&key);
                                        }
                                        true
                                    }
                                    None => false,
                                }
                            }
                            None => false,
                        };
                        assert_eq!(expect, map.delete_value(&key, value));
                    } else {
                        map.insert(StrSource::Copied(&key), StrSource::Copied(value))
                            .unwrap();
                        golden.entry(key).or_default().push(value.clone());
                    }
                }

                assert_eq!(golden.len(), map.key_count());
                for (key, values) in &golden {
                    assert_eq!(values.len(), map.value_count(key));
                    let actual: Vec<&[u8]> = map.values(key).collect();
                    let expected: Vec<&[u8]> =
                        values.iter().map(|v| v.as_slice()).collect();
                    assert_eq!(expected, actual);
                }
            });
    }
}
