// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::hash::{rapidhash, MapKey};
use crate::{GrowMap, MapError};
use allocator_api2::alloc::Allocator;
use core::alloc::Layout;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// An unchecked byte view stored inside the string maps.
///
/// Invariant (crate-internal): every `RawBytes` held in a table points at
/// memory that outlives the table entry, either because the caller vouched
/// for it (borrowed) or because the map copied the bytes into its own
/// allocator. Probe-only instances alias the caller's slice for the
/// duration of one call.
#[derive(Clone, Copy)]
pub(crate) struct RawBytes {
    ptr: *const u8,
    len: usize,
}

impl RawBytes {
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        Self {
            ptr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }

    /// Reborrows the view at an arbitrary lifetime; callers narrow it to a
    /// borrow of whatever keeps the bytes alive.
    ///
    /// # Safety
    /// The pointed-to bytes must still be live.
    pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            &[]
        } else {
            // SAFETY: per the type invariant the bytes are initialized and
            // live; u8 has no alignment demands.
            unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

impl PartialEq for RawBytes {
    fn eq(&self, other: &Self) -> bool {
        // SAFETY: both views uphold the liveness invariant.
        unsafe { self.as_slice() == other.as_slice() }
    }
}

impl Eq for RawBytes {}

impl MapKey for RawBytes {
    fn map_hash(&self, seed: u64) -> u64 {
        // SAFETY: the view upholds the liveness invariant.
        rapidhash(unsafe { self.as_slice() }, seed)
    }
}

/// Copies `bytes` into `allocator`, returning a view of the copy.
pub(crate) fn copy_into<A: Allocator>(allocator: &A, bytes: &[u8]) -> Result<RawBytes, MapError> {
    if bytes.is_empty() {
        return Ok(RawBytes::from_slice(&[]));
    }
    let layout = Layout::for_value(bytes);
    let copy = allocator.allocate(layout)?;
    // SAFETY: a fresh allocation of at least bytes.len() writable bytes,
    // which cannot overlap the source.
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), copy.as_ptr().cast::<u8>(), bytes.len());
    }
    Ok(RawBytes {
        ptr: copy.as_ptr().cast::<u8>().cast_const(),
        len: bytes.len(),
    })
}

/// Hands a copy made by [copy_into] back to the allocator. A no-op for the
/// arena allocators, an actual free for reclaiming ones.
///
/// # Safety
/// `raw` must have come from [copy_into] with this same allocator, and no
/// view of it may be used afterwards.
pub(crate) unsafe fn free_copy<A: Allocator>(allocator: &A, raw: RawBytes) {
    if raw.len == 0 {
        return;
    }
    // SAFETY: same address and layout as the copy_into allocation.
    unsafe {
        let ptr = NonNull::new_unchecked(raw.ptr.cast_mut());
        allocator.deallocate(ptr, Layout::from_size_align_unchecked(raw.len, 1));
    }
}

/// One side of a string-map insertion, carrying the bytes together with the
/// ownership the map should apply to them.
///
/// `Borrowed` bytes must outlive the map (the `'m` lifetime holds callers
/// to it); the map stores the view as-is and later mutations of the caller
/// buffer are visible through the map. `Copied` bytes only need to live
/// through the call: the map duplicates them into its allocator, and the
/// caller's buffer can be reused freely afterwards.
pub enum StrSource<'m, 'c> {
    Borrowed(&'m [u8]),
    Copied(&'c [u8]),
}

impl<'m, 'c> StrSource<'m, 'c> {
    fn bytes(&self) -> &[u8] {
        match self {
            StrSource::Borrowed(b) => b,
            StrSource::Copied(b) => b,
        }
    }

    /// Resolves to a stored view, copying when asked to.
    /// Returns the view and whether it owns a copy.
    fn resolve<A: Allocator>(&self, allocator: &A) -> Result<(RawBytes, bool), MapError> {
        match self {
            StrSource::Borrowed(b) => Ok((RawBytes::from_slice(b), false)),
            StrSource::Copied(b) => Ok((copy_into(allocator, b)?, true)),
        }
    }
}

#[derive(Clone, Copy)]
struct StrEntry {
    value: RawBytes,
    key_copied: bool,
    value_copied: bool,
}

/// A byte-string to byte-string hash map over a caller allocator, with a
/// per-side choice between aliasing the caller's memory and owning a copy
/// (see [StrSource]).
///
/// Deleting an entry returns its copies to the allocator, which reclaims
/// them or not according to its own nature; arena-backed maps simply let
/// the arena's bulk reclamation handle it.
pub struct StrMap<'s, A: Allocator> {
    inner: GrowMap<RawBytes, StrEntry, A>,
    _source: PhantomData<&'s [u8]>,
}

impl<'s, A: Allocator> StrMap<'s, A> {
    /// Creates a map with room for `initial_items` entries before the
    /// first rehash and the given load factor (in (0, 1) exclusive) and
    /// hash seed. See the crate docs for seeding guidance.
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

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts or updates the entry for the key bytes. On update, the old
    /// value's copy (if the map owned one) goes back to the allocator and
    /// the stored key keeps its original ownership.
    pub fn insert(
        &mut self,
        key: StrSource<'s, '_>,
        value: StrSource<'s, '_>,
    ) -> Result<(), MapError> {
        let probe = RawBytes::from_slice(key.bytes());

        if let Some(&old) = self.inner.get(&probe) {
            let (value_raw, value_copied) = value.resolve(self.inner.allocator())?;
            let entry = self.inner.get_mut(&probe);
            // The immutable lookup above just found it; no mutation between.
            debug_assert!(entry.is_some());
            if let Some(entry) = entry {
                *entry = StrEntry {
                    value: value_raw,
                    key_copied: old.key_copied,
                    value_copied,
                };
            }
            if old.value_copied {
                // SAFETY: the old copy was made by this map's allocator and
                // its view was just overwritten.
                unsafe { free_copy(self.inner.allocator(), old.value) };
            }
            return Ok(());
        }

        let (key_raw, key_copied) = key.resolve(self.inner.allocator())?;
        let (value_raw, value_copied) = match value.resolve(self.inner.allocator()) {
            Ok(resolved) => resolved,
            Err(e) => {
                if key_copied {
                    // SAFETY: the fresh key copy never became reachable.
                    unsafe { free_copy(self.inner.allocator(), key_raw) };
                }
                return Err(e);
            }
        };
        let entry = StrEntry {
            value: value_raw,
            key_copied,
            value_copied,
        };
        if let Err(e) = self.inner.insert(key_raw, entry) {
            // SAFETY: the fresh copies never became reachable.
            unsafe {
                if key_copied {
                    free_copy(self.inner.allocator(), key_raw);
                }
                if value_copied {
                    free_copy(self.inner.allocator(), value_raw);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// The value stored for the key bytes.
    pub fn get<'m>(&'m self, key: &[u8]) -> Option<&'m [u8]> {
        let probe = RawBytes::from_slice(key);
        // SAFETY: stored views stay live for the map borrow `'m`.
        self.inner
            .get(&probe)
            .map(|entry| unsafe { entry.value.as_slice() })
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.inner.contains_key(&RawBytes::from_slice(key))
    }

    /// Removes the entry for the key bytes, handing any owned copies back
    /// to the allocator. Returns whether an entry was removed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let probe = RawBytes::from_slice(key);
        let Some((&stored_key, &entry)) = self.inner.get_key_value(&probe) else {
            return false;
        };
        let deleted = self.inner.delete(&probe);
        debug_assert!(deleted);
        // SAFETY: the entry is out of the table, so the copies have no
        // remaining readers.
        unsafe {
            if entry.key_copied {
                free_copy(self.inner.allocator(), stored_key);
            }
            if entry.value_copied {
                free_copy(self.inner.allocator(), entry.value);
            }
        }
        deleted
    }

    /// Iterates `(key, value)` entries in slot order.
    pub fn iter<'m>(&'m self) -> StrEntryIter<'m> {
        StrEntryIter {
            inner: self.inner.iter(),
        }
    }
}

impl<A: Allocator> Drop for StrMap<'_, A> {
    fn drop(&mut self) {
        // Hand every owned copy back before the table arrays go.
        for (key, entry) in self.inner.iter() {
            // SAFETY: drop is the last reader of these views.
            unsafe {
                if entry.key_copied {
                    free_copy(self.inner.allocator(), *key);
                }
                if entry.value_copied {
                    free_copy(self.inner.allocator(), entry.value);
                }
            }
        }
    }
}

/// Iterator over a [StrMap]'s entries.
pub struct StrEntryIter<'m> {
    inner: crate::table::Iter<'m, RawBytes, StrEntry>,
}

impl<'m> Iterator for StrEntryIter<'m> {
    type Item = (&'m [u8], &'m [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, entry) = self.inner.next()?;
        // SAFETY: stored views stay live for the map borrow `'m`.
        Some(unsafe { (key.as_slice(), entry.value.as_slice()) })
    }
}
