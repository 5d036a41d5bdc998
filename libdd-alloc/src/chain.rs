// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::utils::fill_reclaimed;
use crate::LinearAllocator;
use crate::{AllocError, Allocator};
use core::alloc::Layout;
use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr::NonNull;

/// [ChainAllocator] is an arena allocator, meaning that deallocating
/// individual allocations made by this allocator does nothing. Instead, the
/// whole backing memory is dropped at once. Destructors for these objects
/// are not called automatically and must be done by the caller if it's
/// necessary.
///
/// [ChainAllocator] creates a new [LinearAllocator] when the current one
/// doesn't have enough space for the requested allocation, and then links
/// the new [LinearAllocator] to the previous one, creating a chain. This is
/// where its name comes from.
///
/// [ChainAllocator::reset] rewinds the chain instead of returning memory:
/// the oldest node is emptied and kept as the active node, and every other
/// node moves to a retired list. Growth reuses retired nodes before asking
/// the backing allocator for fresh memory, so a reset-and-refill workload
/// settles into zero backing allocations per cycle.
pub struct ChainAllocator<A: Allocator + Clone> {
    top: UnsafeCell<ChainNodePtr<A>>,
    /// Nodes parked by `reset`, linked through their `prev` fields.
    retired: UnsafeCell<ChainNodePtr<A>>,
    /// The size hint for the linear allocator's chunk.
    node_size: usize,
    allocator: A,
}

struct ChainNodePtr<A: Allocator> {
    ptr: Option<NonNull<ChainNode<A>>>,
}

// Derived Clone/Copy would put bounds on A; hand-write them instead.
impl<A: Allocator> Clone for ChainNodePtr<A> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<A: Allocator> Copy for ChainNodePtr<A> {}

impl<A: Allocator> ChainNodePtr<A> {
    const fn none() -> Self {
        Self { ptr: None }
    }

    #[inline]
    fn as_mut_ptr(&self) -> *mut ChainNode<A> {
        match self.ptr {
            Some(non_null) => non_null.as_ptr(),
            None => core::ptr::null_mut(),
        }
    }

    fn as_ref(&self) -> Option<&ChainNode<A>> {
        // SAFETY: active as long as not-null, never give out mut refs.
        self.ptr.map(|p| unsafe { p.as_ref() })
    }
}

/// The node exists inside the allocation owned by `linear`.
struct ChainNode<A: Allocator> {
    prev: UnsafeCell<ChainNodePtr<A>>,
    linear: LinearAllocator<A>,
    /// Cursor position right after this node's own header allocation;
    /// rewinding the node for reuse goes back to here, not to zero.
    base_mark: usize,
}

impl<A: Allocator> ChainNode<A> {
    #[inline]
    fn prev_ptr(&self) -> *mut ChainNode<A> {
        // SAFETY: all references are temporary and do not escape local scope,
        // preventing multiple references.
        unsafe { (*self.prev.get()).as_mut_ptr() }
    }

    fn remaining_capacity(&self) -> usize {
        self.linear.remaining_capacity()
    }

    fn has_capacity_for(&self, layout: Layout) -> bool {
        self.linear.has_capacity_for(layout)
    }
}

unsafe impl<A: Allocator + Clone + Send> Send for ChainAllocator<A> {}

impl<A: Allocator + Clone> ChainAllocator<A> {
    /// The amount of bytes used by the [ChainAllocator] at the start of each
    /// chunk of the chain for bookkeeping: the node record plus the linear
    /// allocator's length prefixes for the node and for the first payload.
    pub const CHAIN_NODE_OVERHEAD: usize = size_of::<ChainNode<A>>() + 2 * size_of::<u64>();

    /// The individual nodes need to be big enough that the overhead of a
    /// chain is worth it. This is somewhat arbitrarily chosen at the moment.
    const MIN_NODE_SIZE: usize = 4 * Self::CHAIN_NODE_OVERHEAD;

    /// Creates a new [ChainAllocator]. The `chunk_size_hint` is used as a
    /// size hint when creating new chunks of the chain. Note that the
    /// [ChainAllocator] will use some bytes at the beginning of each chunk
    /// of the chain. The number of bytes is [Self::CHAIN_NODE_OVERHEAD].
    /// Keep this in mind when sizing your hint if you are trying to be
    /// precise, such as making sure a specific object fits.
    pub const fn new_in(chunk_size_hint: usize, allocator: A) -> Self {
        Self {
            top: UnsafeCell::new(ChainNodePtr::none()),
            retired: UnsafeCell::new(ChainNodePtr::none()),
            // max is not a const fn, do it manually.
            node_size: if chunk_size_hint < Self::MIN_NODE_SIZE {
                Self::MIN_NODE_SIZE
            } else {
                chunk_size_hint
            },
            allocator,
        }
    }

    /// Minimum fresh-node size able to hold `layout` behind a node header.
    fn min_node_size_for(layout: Layout) -> Result<usize, AllocError> {
        let min_size = layout
            .size()
            .checked_add(Self::CHAIN_NODE_OVERHEAD)
            .ok_or(AllocError)?;
        // `align - 1` slack is always enough room for padding.
        min_size.checked_add(layout.align() - 1).ok_or(AllocError)
    }

    /// Links `node` in as the new top of the chain.
    fn push_top(&self, node: NonNull<ChainNode<A>>) {
        // SAFETY: temporary accesses; nothing else holds a reference into
        // the top pointer cell while this runs.
        unsafe {
            let top = self.top.get();
            (*node.as_ptr()).prev = UnsafeCell::new(*top);
            top.write(ChainNodePtr { ptr: Some(node) });
        }
    }

    /// Takes the first retired node able to satisfy `layout`, if any.
    fn adopt_retired(&self, layout: Layout) -> bool {
        // SAFETY: list surgery with temporary raw accesses only.
        unsafe {
            let mut link: *mut ChainNodePtr<A> = self.retired.get();
            while let Some(node) = (*link).ptr {
                if node.as_ref().has_capacity_for(layout) {
                    // Unlink from the retired list, then push as top.
                    *link = *(*node.as_ptr()).prev.get();
                    self.push_top(node);
                    return true;
                }
                link = (*node.as_ptr()).prev.get();
            }
        }
        false
    }

    #[cold]
    #[inline(never)]
    fn push_new_node(&self, min_size: usize) -> Result<(), AllocError> {
        let chain_layout = Layout::new::<ChainNode<A>>();

        let node_size = min_size.max(self.node_size);
        let linear = {
            let layout = Layout::from_size_align(node_size, chain_layout.align())
                .map_err(|_| AllocError)?
                .pad_to_align();
            LinearAllocator::new_in(layout, self.allocator.clone())?
        };

        // This shouldn't fail: the node size accounts for the overhead.
        let chain_node_addr = linear
            .allocate(chain_layout)?
            .as_ptr()
            .cast::<ChainNode<A>>();
        let base_mark = linear.used_bytes();
        let chain_node = ChainNode {
            prev: UnsafeCell::new(ChainNodePtr::none()),
            linear,
            base_mark,
        };

        // SAFETY: this is a write operation to freshly allocated memory
        // which has the correct layout.
        unsafe { chain_node_addr.write(chain_node) };

        // SAFETY: derived from allocation (not null).
        self.push_top(unsafe { NonNull::new_unchecked(chain_node_addr) });

        Ok(())
    }

    fn capacity_helper(mut ptr: *mut ChainNode<A>) -> usize {
        let mut capacity = 0_usize;
        // SAFETY: if non-null, it's a valid pointer. The reference is
        // short-lived as usual to avoid aliasing issues.
        while let Some(chain_node) = unsafe { ptr.as_ref() } {
            capacity += chain_node.linear.reserved_bytes();
            ptr = chain_node.prev_ptr();
        }
        capacity
    }

    fn top_chain_node_ptr(&self) -> *mut ChainNode<A> {
        // SAFETY: This is never exposed to users, and never used internally
        // in a way it will provide simultaneous mutable references.
        unsafe { (*self.top.get()).as_mut_ptr() }
    }

    /// Get the number of bytes allocated, including bytes for overhead.
    /// It does not count space it _could_ allocate still, such as unused
    /// space at the end of the top node in the chain. It does count
    /// unallocated space at the end of previous nodes in the chain.
    pub fn used_bytes(&self) -> usize {
        let mut chain_node_ptr = self.top_chain_node_ptr();
        let Some(chain_node) = (unsafe { chain_node_ptr.as_ref() }) else {
            return 0;
        };

        // The top node is the one that new allocations are made from, so it
        // is likely only partially full.
        let size = {
            let size = chain_node.linear.used_bytes();
            chain_node_ptr = chain_node.prev_ptr();
            size
        };

        // However, the previous nodes in the chain are all full, or at least
        // they should be considered full as any unused space at the end of
        // the allocation won't get used. So fetch `capacity` for previous
        // nodes in the chain.
        let prev_capacity = Self::capacity_helper(chain_node_ptr);
        size + prev_capacity
    }

    /// Get the number of bytes held by the underlying allocators for this
    /// chain, retired nodes included. This number is greater than or equal
    /// to [Self::used_bytes].
    pub fn reserved_bytes(&self) -> usize {
        let live = Self::capacity_helper(self.top_chain_node_ptr());
        // SAFETY: temporary read of the retired list head.
        let retired = Self::capacity_helper(unsafe { (*self.retired.get()).as_mut_ptr() });
        live + retired
    }

    /// Gets the number of bytes that can be allocated without requesting
    /// more from the underlying allocator or adopting a retired node.
    pub fn remaining_capacity(&self) -> usize {
        // Only need to look at the top node of the chain, all the previous
        // nodes are considered full.
        let chain_ptr = self.top.get();
        // SAFETY: If non-null, this is a valid pointer, and the reference is
        // temporary, as all references for the chain nodes are.
        let top = unsafe { (*chain_ptr).as_ref() };
        top.map(ChainNode::remaining_capacity).unwrap_or(0)
    }

    /// Can the requested `layout` be allocated without requesting more
    /// from the underlying allocator.
    pub fn has_capacity_for(&self, layout: Layout) -> bool {
        let chain_ptr = self.top.get();
        // SAFETY: If non-null, this is a valid pointer, and the reference is
        // temporary, as all references for the chain nodes are.
        if let Some(top) = unsafe { (*chain_ptr).as_ref() } {
            top.has_capacity_for(layout)
        } else {
            false
        }
    }

    /// Rewinds the whole chain. The oldest node stays as the (emptied)
    /// active node; every other node is parked on the retired list for
    /// reuse. No memory returns to the backing allocator.
    ///
    /// Everything previously allocated from this chain becomes invalid.
    /// Taking `&mut self` makes that a compile-time rule for containers
    /// that borrow the allocator.
    pub fn reset(&mut self) {
        // SAFETY: `&mut self` excludes aliasing access to the chain cells;
        // node references stay local to each loop step.
        unsafe {
            let mut cursor = *self.top.get();
            self.top.get().write(ChainNodePtr::none());

            let mut oldest = ChainNodePtr::<A>::none();
            while let Some(node) = cursor.ptr {
                let prev = *(*node.as_ptr()).prev.get();
                let node_ref = node.as_ref();
                node_ref.linear.rewind(node_ref.base_mark);

                if prev.ptr.is_none() {
                    oldest = ChainNodePtr { ptr: Some(node) };
                } else {
                    // Park on the retired list, linked through `prev`.
                    (*node.as_ptr()).prev = UnsafeCell::new(*self.retired.get());
                    self.retired.get().write(ChainNodePtr { ptr: Some(node) });
                }
                cursor = prev;
            }

            self.top.get().write(oldest);
        }
    }
}

unsafe impl<A: Allocator + Clone> Allocator for ChainAllocator<A> {
    #[cfg_attr(debug_assertions, track_caller)]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }
        let layout = layout.pad_to_align();

        if !self.has_capacity_for(layout) && !self.adopt_retired(layout) {
            self.push_new_node(Self::min_node_size_for(layout)?)?;
        }
        debug_assert!(self.has_capacity_for(layout));

        // At this point:
        //  1. There's a top node.
        //  2. It has enough capacity for the allocation.

        let top = self.top.get();
        let chain_node = unsafe { (*top).as_ref().unwrap_unchecked() };

        debug_assert!(chain_node.remaining_capacity() >= layout.size());

        let result = chain_node.linear.allocate(layout);
        // If this fails, there's a bug in the allocator.
        debug_assert!(result.is_ok());
        result
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let wide = self.allocate(layout)?;
        // SAFETY: freshly allocated range of exactly this length.
        unsafe { wide.as_ptr().cast::<u8>().write_bytes(0, wide.len()) };
        Ok(wide)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Only the top node can do anything useful (LIFO shrink); other
        // nodes treat this as the usual arena no-op.
        if let Some(top) = unsafe { (*self.top.get()).as_ref() } {
            if top.linear.contains(ptr) {
                // SAFETY: forwarded caller contract.
                unsafe { top.linear.deallocate(ptr, layout) };
            }
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        // In-place growth is only possible inside the top node.
        if let Some(top) = unsafe { (*self.top.get()).as_ref() } {
            if top.linear.contains(ptr) {
                // SAFETY: forwarded caller contract.
                if let Ok(wide) = unsafe { top.linear.grow(ptr, old_layout, new_layout) } {
                    return Ok(wide);
                }
            }
        }

        // Move to a fresh allocation, possibly in a fresh node.
        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: old block is at least old_layout.size() bytes and cannot
        // overlap the fresh block.
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

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        if let Some(top) = unsafe { (*self.top.get()).as_ref() } {
            if top.linear.contains(ptr) {
                // SAFETY: forwarded caller contract.
                return unsafe { top.linear.shrink(ptr, old_layout, new_layout) };
            }
        }
        if ptr.as_ptr().align_offset(new_layout.align()) == 0 {
            // The block lives in a full older node; hand back a narrower
            // view of it in place.
            return Ok(NonNull::slice_from_raw_parts(ptr, new_layout.size()));
        }
        let new_ptr = self.allocate(new_layout)?;
        // SAFETY: distinct blocks; the old one has at least new_layout.size()
        // initialized bytes because shrink never grows.
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr().cast::<u8>(),
                new_layout.size(),
            );
        }
        Ok(new_ptr)
    }
}

impl<A: Allocator + Clone> Drop for ChainAllocator<A> {
    fn drop(&mut self) {
        // SAFETY: both list heads are plain pointer cells; reading them out
        // cannot double-drop anything.
        let live = unsafe { self.top.get().read() };
        let retired = unsafe { self.retired.get().read() };

        for head in [live, retired] {
            let mut chain_node_ptr = head;
            loop {
                match chain_node_ptr.ptr {
                    None => break,
                    Some(non_null) => {
                        // SAFETY: the chunk hasn't been dropped yet, so the
                        // ptr to the chunk is alive. The prev pointer of the
                        // chunk is moved to the stack before the chunk is
                        // dropped, so it stays valid after the drop below.
                        chain_node_ptr = unsafe {
                            let unsafe_cell =
                                core::ptr::addr_of!((*non_null.as_ptr()).prev).read();
                            unsafe_cell.get().read()
                        };

                        // SAFETY: the chunk hasn't been dropped yet, and the
                        // linear allocator lives in the chunk. Moving it to
                        // the stack before dropping avoids a fringe lifetime
                        // issue which could occur with drop_in_place.
                        let alloc = unsafe {
                            core::ptr::addr_of_mut!((*non_null.as_ptr()).linear).read()
                        };
                        drop(alloc);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::*;
    use allocator_api2::alloc::Global;

    #[test]
    fn fuzz() {
        // avoid SUMMARY: libFuzzer: out-of-memory
        const MAX_SIZE: usize = 0x10000000;

        use bolero::TypeGenerator;
        let size_hint = 0..=MAX_SIZE;
        // Large align bits can make allocations fail, which the fuzz loop
        // tolerates, but the chain has a debug assert that post-grow
        // allocation succeeds. Clamping keeps unit-test mode quiet without
        // losing much coverage.
        let align_bits = 0..32;
        let size = 0..=MAX_SIZE;
        let idx = 0..=MAX_SIZE;
        let val = u8::produce();
        let allocs = Vec::<(usize, u32, usize, u8)>::produce()
            .with()
            .values((size, align_bits, idx, val));
        bolero::check!()
            .with_generator((size_hint, allocs))
            .for_each(|(size_hint, size_align_vec)| {
                let allocator = ChainAllocator::new_in(*size_hint, Global);

                for (size, align_bits, idx, val) in size_align_vec {
                    fuzzer_inner_loop(&allocator, *size, *align_bits, *idx, *val, MAX_SIZE)
                }
            })
    }

    #[test]
    fn test_basics() {
        let allocator = ChainAllocator::new_in(4096, Global);
        let layout = Layout::new::<[u8; 8]>();
        let ptr = allocator.allocate(layout).unwrap();

        // deallocate doesn't return memory to the allocator, but it
        // shouldn't panic, as that prevents use in containers.
        unsafe { allocator.deallocate(ptr.cast(), layout) };
    }

    #[test]
    fn test_large_allocations() {
        let allocator = ChainAllocator::new_in(4096, Global);

        // Force an allocation, so it makes a chunk of the minimum size.
        {
            let ptr = allocator.allocate(Layout::new::<u8>()).unwrap();
            unsafe { allocator.deallocate(ptr.cast(), Layout::new::<u8>()) };
        }
        let remaining_capacity = allocator.remaining_capacity();

        // Now make something bigger than the chunk.
        let size = 4 * (remaining_capacity + 1);
        let layout = Layout::from_size_align(size, 1).unwrap();
        let ptr = allocator.allocate(layout).unwrap();
        let actual_size = ptr.len();
        assert!(
            actual_size >= size,
            "expected at least {size} bytes, saw {actual_size}"
        );
        unsafe { allocator.deallocate(ptr.cast(), layout) };
    }

    /// Consumes the top node until not even a single byte fits there, so
    /// the next allocation must adopt a retired node or grow.
    #[track_caller]
    fn fill_to_capacity<A: Allocator + Clone>(allocator: &ChainAllocator<A>) {
        let byte = Layout::new::<u8>();
        while allocator.has_capacity_for(byte) {
            _ = allocator.allocate(byte).unwrap();
        }
    }

    #[test]
    fn test_growth() {
        let page_size = 4096;
        let allocator = ChainAllocator::new_in(page_size, Global);

        let bool_layout = Layout::new::<bool>();

        // test that it fills to capacity a few times.
        for _ in 0..20 {
            fill_to_capacity(&allocator);

            // Trigger it to grow.
            let ptr = allocator.allocate(bool_layout).unwrap();
            unsafe { allocator.deallocate(ptr.cast(), bool_layout) };

            let size = allocator.used_bytes();
            let capacity = allocator.reserved_bytes();
            assert!(size <= capacity, "failed: {size} <= {capacity}");
        }

        let reserved_bytes = allocator.reserved_bytes();
        assert!(reserved_bytes >= page_size * 20);
    }

    #[test]
    fn test_reset_reuses_nodes() {
        let mut allocator = ChainAllocator::new_in(512, Global);

        // Build eight nodes worth of allocations: each loop turn fills the
        // top node and then forces one new node for the u64.
        for _ in 0..8 {
            fill_to_capacity(&allocator);
            _ = allocator.allocate(Layout::new::<u64>()).unwrap();
        }
        let reserved_before = allocator.reserved_bytes();
        assert!(reserved_before > 512);

        allocator.reset();
        // Only the (rewound) oldest node counts as used; its in-place
        // bookkeeping header is all that remains.
        assert!(allocator.used_bytes() <= ChainAllocator::<Global>::CHAIN_NODE_OVERHEAD);
        assert_eq!(reserved_before, allocator.reserved_bytes());

        // Refilling adopts the seven retired nodes instead of reserving new
        // backing memory: one fresh-node demand per loop turn.
        for _ in 0..7 {
            fill_to_capacity(&allocator);
            _ = allocator.allocate(Layout::new::<u64>()).unwrap();
        }
        assert_eq!(reserved_before, allocator.reserved_bytes());
    }

    #[test]
    fn test_reset_on_empty_chain() {
        let mut allocator: ChainAllocator<Global> = ChainAllocator::new_in(4096, Global);
        allocator.reset();
        assert_eq!(0, allocator.used_bytes());
        assert_eq!(0, allocator.reserved_bytes());
        // And it still works afterwards.
        let ptr = allocator.allocate(Layout::new::<u64>()).unwrap();
        unsafe { allocator.deallocate(ptr.cast(), Layout::new::<u64>()) };
    }

    #[test]
    fn test_grow_in_place_at_top() {
        let allocator = ChainAllocator::new_in(4096, Global);
        let old_layout = Layout::array::<u8>(16).unwrap();
        let new_layout = Layout::array::<u8>(64).unwrap();

        let mut ptr = allocator.allocate(old_layout).unwrap();
        unsafe { ptr.as_mut()[..4].copy_from_slice(b"data") };
        let grown = unsafe { allocator.grow(ptr.cast(), old_layout, new_layout) }.unwrap();
        assert_eq!(ptr.as_ptr() as *mut u8, grown.as_ptr() as *mut u8);
        unsafe { assert_eq!(b"data", &grown.as_ref()[..4]) };
    }

    #[test]
    fn test_grow_across_nodes_copies() {
        let allocator = ChainAllocator::new_in(256, Global);
        let old_layout = Layout::array::<u8>(16).unwrap();
        let mut ptr = allocator.allocate(old_layout).unwrap();
        unsafe { ptr.as_mut()[..4].copy_from_slice(b"data") };

        // A growth larger than the node forces relocation to a new node.
        let new_layout = Layout::array::<u8>(4096).unwrap();
        let grown = unsafe { allocator.grow(ptr.cast(), old_layout, new_layout) }.unwrap();
        assert_ne!(ptr.as_ptr() as *mut u8, grown.as_ptr() as *mut u8);
        unsafe { assert_eq!(b"data", &grown.as_ref()[..4]) };
    }
}
