// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::utils::fill_reclaimed;
use crate::{AllocError, Allocator};
use core::alloc::Layout;
use core::cell::Cell;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

/// Stamp for a live pool. Overwritten pool state fails the check and every
/// operation backs off instead of corrupting memory further.
const POOL_SENTINEL: u64 = 0x09A4_C1F0_5BD3_2E87;

/// Stamp for a live slot header.
const SLOT_SENTINEL: u64 = 0x22CC_71B8_E60F_944D;

/// Per-slot bookkeeping, placed directly before each payload.
///
/// `prev_next` holds the address of the predecessor's `next` field (or of
/// the pool's checked-out list head), which makes unlinking O(1) with no
/// special case for the head of the list. A null `prev_next` means the slot
/// is on the free list.
#[repr(C)]
struct SlotHeader {
    sentinel: u64,
    payload: *mut u8,
    prev_next: *mut *mut SlotHeader,
    next: *mut SlotHeader,
}

const SLOT_HEADER_SIZE: usize = size_of::<SlotHeader>();

/// [PoolAllocator] vends fixed-size slots from one backing region with O(1)
/// allocate *and* O(1) individual free, which the arena types cannot do.
///
/// Every slot is preceded by a sentinel-stamped header, and [free] verifies
/// the whole ladder before touching any list: the pointer must fall inside
/// the backing region, the header must be properly aligned and carry both
/// sentinels, its payload pointer must point back at the freed pointer, and
/// the slot must currently be checked out. That catches interior pointers,
/// pointers into a different pool, double frees, and header corruption, all
/// of which return `false` and mutate nothing.
///
/// Slot payload alignment scales with the slot size: 8 bytes for small
/// slots, one cache line above 64 bytes, one page at 2 KiB and beyond.
///
/// [free]: PoolAllocator::free
pub struct PoolAllocator<A: Allocator> {
    region: NonNull<u8>,
    region_layout: Layout,
    slot_size: usize,
    slot_align: usize,
    free_list: Cell<*mut SlotHeader>,
    checked_out: Cell<*mut SlotHeader>,
    slot_count: usize,
    sentinel: u64,
    allocator: A,
}

unsafe impl<A: Allocator + Send> Send for PoolAllocator<A> {}

/// Payload alignment for a given slot size.
fn alignment_for(slot_size: usize) -> usize {
    if slot_size >= 2 * 1024 {
        4096
    } else if slot_size > 64 {
        64
    } else {
        8
    }
}

impl<A: Allocator> PoolAllocator<A> {
    /// Creates a pool by requesting `region_size` bytes from `allocator`
    /// and carving it into as many `slot_size` slots (plus headers and
    /// alignment padding) as fit. `slot_size` must be a power of two.
    ///
    /// Fails if the arguments are invalid, the backing allocation fails, or
    /// not even one slot fits.
    pub fn new_in(region_size: usize, slot_size: usize, allocator: A) -> Result<Self, AllocError> {
        if slot_size == 0 || !slot_size.is_power_of_two() {
            return Err(AllocError);
        }

        let slot_align = alignment_for(slot_size);
        let region_layout =
            Layout::from_size_align(region_size, slot_align.max(align_of::<SlotHeader>()))
                .map_err(|_| AllocError)?;
        let region = allocator.allocate(region_layout)?;
        // SAFETY: the allocation len is the real region size.
        let region_layout = unsafe {
            Layout::from_size_align(region.len(), region_layout.align()).unwrap_unchecked()
        };
        let region: NonNull<u8> = region.cast();

        let mut pool = Self {
            region,
            region_layout,
            slot_size,
            slot_align,
            free_list: Cell::new(ptr::null_mut()),
            checked_out: Cell::new(ptr::null_mut()),
            slot_count: 0,
            sentinel: POOL_SENTINEL,
            allocator,
        };
        pool.carve_slots();

        if pool.slot_count == 0 {
            // Not even one slot fits; hand the region back.
            // Dropping the pool performs the deallocation.
            return Err(AllocError);
        }
        Ok(pool)
    }

    /// Walks the backing region placing one header + aligned payload per
    /// slot and threading them all onto the free list.
    fn carve_slots(&mut self) {
        let base = self.region.as_ptr() as usize;
        let end = base + self.region_layout.size();

        let mut cursor = base;
        loop {
            let Some(after_header) = cursor.checked_add(SLOT_HEADER_SIZE) else {
                break;
            };
            // Aligning the payload also aligns the header: the header size
            // is a multiple of its own alignment and slot_align >= 8.
            let payload = match after_header.checked_add(self.slot_align - 1) {
                Some(upper) => upper & !(self.slot_align - 1),
                None => break,
            };
            let Some(slot_end) = payload.checked_add(self.slot_size) else {
                break;
            };
            if slot_end > end {
                break;
            }

            let header = (payload - SLOT_HEADER_SIZE) as *mut SlotHeader;
            // SAFETY: header + payload lie inside the backing region and the
            // header address is properly aligned per the comment above.
            unsafe {
                header.write(SlotHeader {
                    sentinel: SLOT_SENTINEL,
                    payload: payload as *mut u8,
                    prev_next: ptr::null_mut(),
                    next: self.free_list.get(),
                });
            }
            self.free_list.set(header);
            self.slot_count += 1;
            cursor = slot_end;
        }
    }

    /// Pops a slot off the free list. Returns null-free payload memory of
    /// exactly the configured slot size, or `None` when every slot is
    /// checked out.
    pub fn allocate_slot(&self, zeroed: bool) -> Option<NonNull<u8>> {
        if self.sentinel != POOL_SENTINEL {
            return None;
        }

        let header = self.free_list.get();
        if header.is_null() {
            return None;
        }

        // SAFETY: headers on the free list are valid by construction; the
        // raw accesses below are plain list surgery within this pool.
        unsafe {
            self.free_list.set((*header).next);

            let co_head = self.checked_out.get();
            (*header).next = co_head;
            (*header).prev_next = self.checked_out.as_ptr();
            if !co_head.is_null() {
                (*co_head).prev_next = ptr::addr_of_mut!((*header).next);
            }
            self.checked_out.set(header);

            let payload = (*header).payload;
            if zeroed {
                payload.write_bytes(0, self.slot_size);
            }
            Some(NonNull::new_unchecked(payload))
        }
    }

    /// Returns a slot to the pool.
    ///
    /// The pointer is fully re-verified first; see the type docs for the
    /// ladder of checks. On any failure this returns `false` and neither
    /// pool's state changes.
    ///
    /// # Safety
    /// No reference may be live into the slot's payload: on success the
    /// payload is reclaimed (and pattern-filled in debug builds). The
    /// pointer itself may be arbitrary; pointers this pool did not hand
    /// out are detected and rejected without being dereferenced outside
    /// the pool's own region.
    pub unsafe fn free(&self, allocation: NonNull<u8>) -> bool {
        if self.sentinel != POOL_SENTINEL {
            return false;
        }

        let addr = allocation.as_ptr() as usize;
        let base = self.region.as_ptr() as usize;
        if addr < base || addr >= base + self.region_layout.size() {
            return false;
        }

        let Some(header_addr) = addr.checked_sub(SLOT_HEADER_SIZE) else {
            return false;
        };
        if header_addr < base || header_addr % align_of::<SlotHeader>() != 0 {
            return false;
        }

        let header = header_addr as *mut SlotHeader;
        // SAFETY: the address range was just bounds- and alignment-checked;
        // the reads may see garbage for a non-slot pointer, which the
        // sentinel and back-pointer checks below reject.
        unsafe {
            if (*header).sentinel != SLOT_SENTINEL
                || (*header).payload != allocation.as_ptr()
                || (*header).prev_next.is_null()
            {
                return false;
            }

            // Unlink from the checked-out list.
            *(*header).prev_next = (*header).next;
            if !(*header).next.is_null() {
                (*(*header).next).prev_next = (*header).prev_next;
            }

            (*header).prev_next = ptr::null_mut();
            (*header).next = self.free_list.get();
            self.free_list.set(header);

            fill_reclaimed((*header).payload, self.slot_size);
        }
        true
    }

    /// Moves every checked-out slot back to the free list.
    pub fn free_all(&mut self) {
        if self.sentinel != POOL_SENTINEL {
            return;
        }

        let mut current = self.checked_out.get();
        while !current.is_null() {
            // SAFETY: every node on the checked-out list is a valid header.
            unsafe {
                let next = (*current).next;
                (*current).prev_next = ptr::null_mut();
                (*current).next = self.free_list.get();
                self.free_list.set(current);
                fill_reclaimed((*current).payload, self.slot_size);
                current = next;
            }
        }
        self.checked_out.set(ptr::null_mut());
    }

    /// Slot payload size.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots carved out of the backing region.
    pub fn total_allocation_count(&self) -> usize {
        self.slot_count
    }

    /// Number of slots currently on the free list. Walks the list.
    pub fn free_allocation_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.free_list.get();
        while !current.is_null() {
            count += 1;
            // SAFETY: free-list nodes are valid headers.
            current = unsafe { (*current).next };
        }
        count
    }

    /// Number of slots currently handed out. Walks the list.
    pub fn checked_out_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.checked_out.get();
        while !current.is_null() {
            count += 1;
            // SAFETY: checked-out nodes are valid headers.
            current = unsafe { (*current).next };
        }
        count
    }
}

impl<A: Allocator> Drop for PoolAllocator<A> {
    fn drop(&mut self) {
        self.sentinel = 0;
        // SAFETY: handing the backing region back with its original layout.
        unsafe { self.allocator.deallocate(self.region, self.region_layout) };
    }
}

unsafe impl<A: Allocator> Allocator for PoolAllocator<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 || layout.size() > self.slot_size || layout.align() > self.slot_align
        {
            return Err(AllocError);
        }
        match self.allocate_slot(false) {
            Some(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, self.slot_size)),
            None => Err(AllocError),
        }
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 || layout.size() > self.slot_size || layout.align() > self.slot_align
        {
            return Err(AllocError);
        }
        match self.allocate_slot(true) {
            Some(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, self.slot_size)),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // SAFETY: the trait contract already forbids live references into
        // the block being deallocated.
        let ok = unsafe { self.free(ptr) };
        debug_assert!(ok, "pool deallocate of a pointer it does not own");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_aligned_to;
    use allocator_api2::alloc::Global;

    fn counts_consistent<A: Allocator>(pool: &PoolAllocator<A>) {
        assert_eq!(
            pool.total_allocation_count(),
            pool.free_allocation_count() + pool.checked_out_count()
        );
    }

    #[test]
    fn test_carving_and_counts() {
        let pool = PoolAllocator::new_in(512, 32, Global).unwrap();
        // 32-byte header + 32-byte slot per allocation, 8-byte alignment:
        // eight slots fit in 512 bytes.
        assert_eq!(8, pool.total_allocation_count());
        assert_eq!(8, pool.free_allocation_count());
        assert_eq!(0, pool.checked_out_count());
        counts_consistent(&pool);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(PoolAllocator::new_in(512, 0, Global).is_err());
        assert!(PoolAllocator::new_in(512, 48, Global).is_err()); // not pow2
        assert!(PoolAllocator::new_in(8, 32, Global).is_err()); // nothing fits
    }

    #[test]
    fn test_alloc_free_reuse() {
        let pool = PoolAllocator::new_in(512, 32, Global).unwrap();

        let a = pool.allocate_slot(false).unwrap();
        let b = pool.allocate_slot(false).unwrap();
        let c = pool.allocate_slot(false).unwrap();
        counts_consistent(&pool);
        let free_after_three = pool.free_allocation_count();

        assert!(unsafe { pool.free(b) });
        // Most recently freed slot is reused first.
        let d = pool.allocate_slot(false).unwrap();
        assert_eq!(b.as_ptr(), d.as_ptr());
        assert_eq!(8, pool.total_allocation_count());
        assert_eq!(free_after_three, pool.free_allocation_count());
        counts_consistent(&pool);

        assert!(unsafe { pool.free(a) });
        assert!(unsafe { pool.free(c) });
        assert!(unsafe { pool.free(d) });
        assert_eq!(8, pool.free_allocation_count());
    }

    #[test]
    fn test_alignment_ladder() {
        let small = PoolAllocator::new_in(1024, 32, Global).unwrap();
        let p = small.allocate_slot(false).unwrap();
        assert!(is_aligned_to(p.as_ptr(), 8));

        let medium = PoolAllocator::new_in(4096, 128, Global).unwrap();
        let p = medium.allocate_slot(false).unwrap();
        assert!(is_aligned_to(p.as_ptr(), 64));

        let large = PoolAllocator::new_in(64 * 1024, 4096, Global).unwrap();
        let p = large.allocate_slot(false).unwrap();
        assert!(is_aligned_to(p.as_ptr(), 4096));
    }

    #[test]
    fn test_free_rejects_bad_pointers() {
        let pool = PoolAllocator::new_in(512, 32, Global).unwrap();
        let other_pool = PoolAllocator::new_in(512, 32, Global).unwrap();

        let a = pool.allocate_slot(false).unwrap();
        let b = other_pool.allocate_slot(false).unwrap();
        let free_before = pool.free_allocation_count();

        // Interior pointer.
        let interior = unsafe { NonNull::new_unchecked(a.as_ptr().add(4)) };
        assert!(!unsafe { pool.free(interior) });

        // Pointer owned by a different pool.
        assert!(!unsafe { pool.free(b) });

        // Stack pointer way outside the region.
        let mut on_stack = 0u8;
        assert!(!unsafe { pool.free(NonNull::from(&mut on_stack)) });

        // Nothing moved.
        assert_eq!(free_before, pool.free_allocation_count());
        assert_eq!(1, pool.checked_out_count());
        counts_consistent(&pool);
        counts_consistent(&other_pool);

        assert!(unsafe { pool.free(a) });
        assert!(unsafe { other_pool.free(b) });
    }

    #[test]
    fn test_double_free_rejected() {
        let pool = PoolAllocator::new_in(512, 32, Global).unwrap();
        let a = pool.allocate_slot(false).unwrap();
        assert!(unsafe { pool.free(a) });
        assert!(!unsafe { pool.free(a) });
        counts_consistent(&pool);
    }

    #[test]
    fn test_free_rejects_zeroed_header() {
        let pool = PoolAllocator::new_in(512, 32, Global).unwrap();
        let a = pool.allocate_slot(false).unwrap();

        // Simulate a buffer underrun wiping the header.
        unsafe { a.as_ptr().sub(SLOT_HEADER_SIZE).write_bytes(0, SLOT_HEADER_SIZE) };
        assert!(!unsafe { pool.free(a) });
        assert_eq!(1, pool.checked_out_count());
    }

    #[test]
    fn test_free_all() {
        let pool_backing = Global;
        let mut pool = PoolAllocator::new_in(1024, 32, pool_backing).unwrap();
        let total = pool.total_allocation_count();

        let mut held = Vec::new();
        while let Some(p) = pool.allocate_slot(false) {
            held.push(p);
        }
        assert_eq!(total, pool.checked_out_count());

        pool.free_all();
        assert_eq!(total, pool.free_allocation_count());
        assert_eq!(0, pool.checked_out_count());

        // The pool is fully usable again.
        assert!(pool.allocate_slot(true).is_some());
    }

    #[test]
    fn test_zeroed_allocation() {
        let pool = PoolAllocator::new_in(512, 32, Global).unwrap();
        let p = pool.allocate_slot(false).unwrap();
        // Scribble, free, reallocate zeroed: the scribbles must be gone.
        unsafe { p.as_ptr().write_bytes(0xAB, pool.slot_size()) };
        assert!(unsafe { pool.free(p) });
        let q = pool.allocate_slot(true).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), pool.slot_size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocator_trait_surface() {
        let pool = PoolAllocator::new_in(1024, 64, Global).unwrap();

        // Fits in a slot.
        let layout = Layout::from_size_align(48, 8).unwrap();
        let wide = pool.allocate(layout).unwrap();
        assert_eq!(64, wide.len());
        unsafe { pool.deallocate(wide.cast(), layout) };

        // Too large for a slot.
        let too_big = Layout::from_size_align(65, 8).unwrap();
        assert!(pool.allocate(too_big).is_err());

        // Alignment beyond the slot alignment.
        let over_aligned = Layout::from_size_align(16, 4096).unwrap();
        assert!(pool.allocate(over_aligned).is_err());
    }
}
