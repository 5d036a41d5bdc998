// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::utils::fill_reclaimed;
use crate::{AllocError, Allocator};
use core::alloc::Layout;
use core::cell::Cell;
use core::mem::{align_of, size_of};
use core::ptr::{slice_from_raw_parts_mut, NonNull};

/// Length prefix stored immediately before every payload. It records the
/// payload's current size so the most recent allocation can be resized in
/// place without the caller re-supplying it.
type BlockHeader = u64;

const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// [LinearAllocator] is an arena allocator, meaning that deallocating
/// individual allocations made by this allocator does nothing (with one
/// exception below). Instead, the whole backing memory is reclaimed at once
/// by [LinearAllocator::reset] or when the allocator is dropped.
/// Destructors for the allocated objects are not called automatically and
/// must be run by the caller if needed.
///
/// Once the slice of memory that underpins the LinearAllocator has been
/// consumed, allocations begin to fail. It will not find new memory to back
/// allocations; layer a [crate::ChainAllocator] on top for that.
///
/// Each allocation carries an 8 byte length prefix, which is what makes
/// three things work:
///  - `grow`/`shrink` of the **most recent** allocation happens in place,
///  - `deallocate` of the most recent allocation rewinds the cursor (LIFO
///    shrink); for anything older it is a no-op,
///  - [LinearAllocator::save] / [LinearAllocator::restore] can rewind to
///    any earlier point, invalidating everything allocated after it.
///
/// In debug builds, every reclaimed byte range is overwritten with
/// [crate::RECLAIM_PATTERN] to surface use-after-reset bugs.
pub struct LinearAllocator<A: Allocator> {
    allocation_ptr: NonNull<u8>,
    allocation_layout: Layout,
    used: Cell<usize>,
    allocator: A,
}

unsafe impl<A: Allocator + Send> Send for LinearAllocator<A> {}

/// An opaque cursor position returned by [LinearAllocator::save].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mark(usize);

impl<A: Allocator> LinearAllocator<A> {
    /// Creates a new [LinearAllocator] by requesting the `layout` from the
    /// provided `allocator`. Note that if the allocation is over-sized,
    /// meaning it's larger than the requested `layout.size()`, then the
    /// [LinearAllocator] will utilize this excess.
    pub fn new_in(layout: Layout, allocator: A) -> Result<Self, AllocError> {
        let allocation = allocator.allocate(layout)?;
        // SAFETY: this is the size/align of the actual allocation, so it must
        // be valid since the object exists.
        let allocation_layout =
            unsafe { Layout::from_size_align(allocation.len(), layout.align()).unwrap_unchecked() };
        Ok(Self {
            allocation_ptr: allocation.cast(),
            allocation_layout,
            used: Cell::new(0),
            allocator,
        })
    }

    /// Get the number of bytes consumed, headers and padding included.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used.get()
    }

    /// Get the number of bytes allocated by the underlying allocator.
    /// This number is greater than or equal to [Self::used_bytes].
    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.allocation_layout.size()
    }

    /// Gets the number of bytes that can still be consumed without the
    /// underlying allocator being asked for more (which never happens; the
    /// allocator fails instead).
    pub fn remaining_capacity(&self) -> usize {
        self.reserved_bytes() - self.used_bytes()
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self.allocation_ptr.as_ptr()
    }

    /// Whether `ptr` points into this allocator's backing region.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let base = self.base_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + self.reserved_bytes()
    }

    /// Effective alignment of a payload: at least the header's, so the
    /// prefix before the payload stays addressable.
    #[inline]
    fn effective_align(layout: Layout) -> usize {
        layout.align().max(align_of::<BlockHeader>())
    }

    /// Byte offsets `(payload, end)` at which a fresh allocation of `layout`
    /// would land, or None if it doesn't fit.
    fn placement(&self, layout: Layout) -> Option<(usize, usize)> {
        let header_end = self.used_bytes().checked_add(HEADER_SIZE)?;
        if header_end > self.reserved_bytes() {
            return None;
        }
        // SAFETY: header_end <= reserved, so this is at most one past the
        // end of the backing allocation.
        let after_header = unsafe { self.base_ptr().add(header_end) };
        let align_offset = after_header.align_offset(Self::effective_align(layout));
        let payload = header_end.checked_add(align_offset)?;
        let end = payload.checked_add(layout.size())?;
        (end <= self.reserved_bytes()).then_some((payload, end))
    }

    /// Determine if the given layout will fit in the remaining capacity.
    pub fn has_capacity_for(&self, layout: Layout) -> bool {
        layout.size() > 0 && self.placement(layout).is_some()
    }

    /// Records the current cursor. Allocations made after this call are
    /// reclaimed by handing the mark back to [Self::restore].
    pub fn save(&self) -> Mark {
        Mark(self.used.get())
    }

    /// Rewinds to a previously saved mark. Everything allocated since the
    /// mark becomes invalid; in debug builds it is pattern-filled.
    ///
    /// # Panics
    /// Panics if the mark lies beyond the current cursor, which means it
    /// came from a different allocator or from after a later `restore`.
    pub fn restore(&mut self, mark: Mark) {
        let used = self.used.get();
        assert!(
            mark.0 <= used,
            "restore mark is ahead of the allocation cursor"
        );
        // SAFETY: `&mut self` means no outstanding shared borrows of the
        // region through this allocator, and [mark, used) is within the
        // backing allocation.
        unsafe { self.rewind(mark.0) };
    }

    /// Rewinds to empty. Equivalent to restoring a mark taken right after
    /// construction.
    pub fn reset(&mut self) {
        // SAFETY: as in restore; 0 <= used always.
        unsafe { self.rewind(0) };
    }

    /// Rewind primitive shared by restore/reset and the chain allocator's
    /// bulk reset.
    ///
    /// # Safety
    /// `mark` must be at most `used_bytes()`, and no live reference may
    /// point into the region beyond `mark`.
    pub(crate) unsafe fn rewind(&self, mark: usize) {
        let used = self.used.get();
        debug_assert!(mark <= used);
        // SAFETY: [mark, used) is an initialized part of the backing region.
        unsafe { fill_reclaimed(self.base_ptr().add(mark), used - mark) };
        self.used.set(mark);
    }

    /// Header slot for the payload at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a payload previously returned by this allocator.
    #[inline]
    unsafe fn header_ptr(ptr: NonNull<u8>) -> *mut BlockHeader {
        // SAFETY: every payload is preceded by its header within the region.
        unsafe { ptr.as_ptr().sub(HEADER_SIZE) }.cast::<BlockHeader>()
    }

    /// Whether `ptr` (whose header records its length) is the most recent
    /// live allocation, i.e. its end is the cursor.
    ///
    /// # Safety
    /// `ptr` must be a payload previously returned by this allocator.
    unsafe fn is_most_recent(&self, ptr: NonNull<u8>) -> (bool, usize) {
        // SAFETY: per the contract, the header precedes the payload.
        let stored = unsafe { *Self::header_ptr(ptr) } as usize;
        let offset = ptr.as_ptr() as usize - self.base_ptr() as usize;
        (offset + stored == self.used.get(), stored)
    }

    fn allocate_inner(&self, layout: Layout, zeroed: bool) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }

        let (payload, end) = self.placement(layout).ok_or(AllocError)?;

        // Create a wide pointer to the correct place and len.
        let wide_ptr = {
            // SAFETY: placement checked that payload + size fits within the
            // underlying allocation.
            let thin_ptr = unsafe { self.base_ptr().add(payload) };

            // SAFETY: the header slot sits in the HEADER_SIZE bytes that
            // placement reserved directly before the payload.
            unsafe {
                thin_ptr
                    .sub(HEADER_SIZE)
                    .cast::<BlockHeader>()
                    .write_unaligned(layout.size() as BlockHeader)
            };

            debug_assert_eq!(0, thin_ptr.align_offset(layout.align()));
            if zeroed {
                // SAFETY: freshly reserved payload range.
                unsafe { thin_ptr.write_bytes(0, layout.size()) };
            }
            slice_from_raw_parts_mut(thin_ptr, layout.size())
        };

        self.used.set(end);

        // SAFETY: derived from the underlying allocation pointer, so it is
        // inherently not null.
        Ok(unsafe { NonNull::new_unchecked(wide_ptr) })
    }
}

impl<A: Allocator> Drop for LinearAllocator<A> {
    fn drop(&mut self) {
        let ptr = self.allocation_ptr;
        let layout = self.allocation_layout;
        // SAFETY: passing the original ptr back in, with a compatible layout.
        unsafe { self.allocator.deallocate(ptr, layout) };
    }
}

unsafe impl<A: Allocator> Allocator for LinearAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate_inner(layout, false)
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate_inner(layout, true)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // LIFO shrink: the most recent allocation gives its bytes back,
        // anything older waits for reset/drop.
        // SAFETY: caller promises ptr came from this allocator.
        let (most_recent, stored) = unsafe { self.is_most_recent(ptr) };
        if most_recent {
            let offset = ptr.as_ptr() as usize - self.base_ptr() as usize;
            debug_assert!(offset >= HEADER_SIZE);
            // SAFETY: rewinding over the block just validated as the last
            // one; the caller is relinquishing it.
            unsafe { self.rewind(offset - HEADER_SIZE) };
        } else {
            // SAFETY: the block is initialized memory owned by this arena.
            unsafe { fill_reclaimed(ptr.as_ptr(), stored) };
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        // SAFETY: caller promises ptr came from this allocator.
        let (most_recent, stored) = unsafe { self.is_most_recent(ptr) };
        debug_assert_eq!(stored, old_layout.size());

        let offset = ptr.as_ptr() as usize - self.base_ptr() as usize;
        let aligned = ptr.as_ptr().align_offset(new_layout.align()) == 0;
        let fits = offset
            .checked_add(new_layout.size())
            .is_some_and(|end| end <= self.reserved_bytes());

        if most_recent && aligned && fits {
            // SAFETY: header slot of a live allocation.
            unsafe { Self::header_ptr(ptr).write_unaligned(new_layout.size() as BlockHeader) };
            self.used.set(offset + new_layout.size());
            return Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()));
        }

        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: both blocks live in this region and cannot overlap; the
        // old block is at least old_layout.size() bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr().cast::<u8>(),
                old_layout.size(),
            );
            fill_reclaimed(ptr.as_ptr(), old_layout.size());
        }
        Ok(new_ptr)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // SAFETY: forwarded caller contract.
        let new_ptr = unsafe { self.grow(ptr, old_layout, new_layout)? };
        // SAFETY: the extension [old, new) is within the fresh block.
        unsafe {
            new_ptr
                .as_ptr()
                .cast::<u8>()
                .add(old_layout.size())
                .write_bytes(0, new_layout.size() - old_layout.size())
        };
        Ok(new_ptr)
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        if ptr.as_ptr().align_offset(new_layout.align()) != 0 {
            // Rare: stricter alignment while shrinking. Relocate.
            let new_ptr = self.allocate(new_layout)?;
            // SAFETY: distinct blocks in the same region.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    ptr.as_ptr(),
                    new_ptr.as_ptr().cast::<u8>(),
                    new_layout.size(),
                );
            }
            return Ok(new_ptr);
        }

        // SAFETY: caller promises ptr came from this allocator.
        let (most_recent, _stored) = unsafe { self.is_most_recent(ptr) };
        let offset = ptr.as_ptr() as usize - self.base_ptr() as usize;
        // SAFETY: header slot of a live allocation.
        unsafe { Self::header_ptr(ptr).write_unaligned(new_layout.size() as BlockHeader) };
        if most_recent {
            // SAFETY: the cut tail belongs to the shrinking block.
            unsafe {
                fill_reclaimed(
                    ptr.as_ptr().add(new_layout.size()),
                    old_layout.size() - new_layout.size(),
                )
            };
            self.used.set(offset + new_layout.size());
        }
        Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()))
    }
}
