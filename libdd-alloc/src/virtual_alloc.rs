// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{AllocError, Allocator};
use core::alloc::Layout;
use core::ptr::NonNull;

/// Maps whole pages of anonymous virtual memory per allocation. Meant for
/// large requests only, typically as the backing allocator handing big
/// chunks to [crate::LinearAllocator] or [crate::ChainAllocator]; using it
/// for small objects wastes most of every page.
///
/// Sizes round up to a page multiple, and the rounded-up length is reported
/// back through the returned wide pointer so callers can use the slack.
/// Alignments above the page size are rejected. The OS hands pages out
/// zeroed, so `allocate` and `allocate_zeroed` are the same operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct VirtualAllocator;

/// The system page size.
pub fn page_size() -> Result<usize, AllocError> {
    let size = os::query_page_size()?;
    if size.is_power_of_two() {
        Ok(size)
    } else {
        Err(AllocError)
    }
}

/// Page-multiple mapping length for `layout`, or an error for zero sizes
/// and over-page alignments.
fn mapping_len(layout: Layout) -> Result<usize, AllocError> {
    if layout.size() == 0 {
        return Err(AllocError);
    }
    let page = page_size()?;
    if layout.align() > page {
        return Err(AllocError);
    }
    // Power-of-two round up; `page` was validated as a power of two.
    let mask = page - 1;
    let rem = layout.size() & mask;
    if rem == 0 {
        Ok(layout.size())
    } else {
        layout.size().checked_add(page - rem).ok_or(AllocError)
    }
}

unsafe impl Allocator for VirtualAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let len = mapping_len(layout)?;
        let addr = os::map_pages(len)?;
        Ok(NonNull::slice_from_raw_parts(addr, len))
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        // Fresh anonymous mappings are zero-filled already.
        self.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: the caller passes back a layout compatible with allocate,
        // so the recomputed length matches the original mapping.
        let len = unsafe { mapping_len(layout).unwrap_unchecked() };
        // SAFETY: unmapping a region this allocator mapped.
        unsafe { os::unmap_pages(ptr, len) };
    }
}

#[cfg(unix)]
mod os {
    use allocator_api2::alloc::AllocError;
    use core::ptr::{self, NonNull};

    pub(super) fn query_page_size() -> Result<usize, AllocError> {
        // SAFETY: sysconf with a valid name has no preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(raw).map_err(|_| AllocError)
    }

    pub(super) fn map_pages(len: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: a fresh private anonymous mapping, no fd involved.
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(AllocError);
        }
        // An anonymous mapping without MAP_FIXED never lands at address 0.
        NonNull::new(mapped.cast::<u8>()).ok_or(AllocError)
    }

    /// # Safety
    /// `(ptr, len)` must be a mapping produced by [map_pages].
    pub(super) unsafe fn unmap_pages(ptr: NonNull<u8>, len: usize) {
        // SAFETY: per the function contract.
        _ = unsafe { libc::munmap(ptr.as_ptr().cast(), len as libc::size_t) };
    }
}

#[cfg(windows)]
mod os {
    use allocator_api2::alloc::AllocError;
    use core::mem::MaybeUninit;
    use core::ptr::{self, NonNull};
    use windows_sys::Win32::System::Memory;
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub(super) fn query_page_size() -> Result<usize, AllocError> {
        let mut info = MaybeUninit::<SYSTEM_INFO>::uninit();
        // SAFETY: GetSystemInfo fills the struct and cannot fail.
        let info = unsafe {
            GetSystemInfo(info.as_mut_ptr());
            info.assume_init()
        };
        usize::try_from(info.dwPageSize).map_err(|_| AllocError)
    }

    pub(super) fn map_pages(len: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: a fresh committed allocation, akin to malloc.
        let mapped = unsafe {
            Memory::VirtualAlloc(
                ptr::null(),
                len,
                Memory::MEM_COMMIT | Memory::MEM_RESERVE,
                Memory::PAGE_READWRITE,
            )
        };
        NonNull::new(mapped.cast::<u8>()).ok_or(AllocError)
    }

    /// # Safety
    /// `ptr` must be an allocation produced by [map_pages].
    pub(super) unsafe fn unmap_pages(ptr: NonNull<u8>, _len: usize) {
        // SAFETY: releasing a base address VirtualAlloc returned.
        _ = unsafe { Memory::VirtualFree(ptr.as_ptr().cast(), 0, Memory::MEM_RELEASE) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::fuzzer_inner_loop;
    use bolero::TypeGenerator;

    #[test]
    fn fuzz() {
        #[cfg(miri)]
        const MAX_SIZE: usize = 1_000_000;

        #[cfg(not(miri))]
        const MAX_SIZE: usize = isize::MAX as usize;

        let align_bits = 0..=32;
        let size = usize::produce();
        let idx = usize::produce();
        let val = u8::produce();
        let allocs = Vec::<(usize, u32, usize, u8)>::produce()
            .with()
            .values((size, align_bits, idx, val));
        bolero::check!()
            .with_generator(allocs)
            .for_each(|size_align_vec| {
                let allocator = VirtualAllocator;

                for (size, align_bits, idx, val) in size_align_vec {
                    fuzzer_inner_loop(&allocator, *size, *align_bits, *idx, *val, MAX_SIZE)
                }
            })
    }

    #[test]
    fn test_zero_sized() {
        let alloc = VirtualAllocator;
        assert_eq!(0, core::mem::size_of::<VirtualAllocator>());
        _ = alloc.allocate(Layout::new::<VirtualAllocator>()).unwrap_err();
    }

    #[test]
    fn test_too_large_alignment() {
        let page = page_size().unwrap();
        let layout = Layout::from_size_align(1, page * 2).unwrap().pad_to_align();
        _ = VirtualAllocator.allocate(layout).unwrap_err();
    }

    #[test]
    fn test_rounding_to_pages() {
        let page = page_size().unwrap();
        let alloc = VirtualAllocator;

        for (size, expected) in [(1, page), (page - 1, page), (page, page), (page + 1, 2 * page)]
        {
            let layout = Layout::from_size_align(size, 1).unwrap();
            let wide = alloc.allocate(layout).unwrap();
            assert_eq!(expected, wide.len(), "request of {size} bytes");
            unsafe { alloc.deallocate(wide.cast(), layout) };
        }
    }

    #[test]
    fn test_zeroed_by_construction() {
        let page = page_size().unwrap();
        let layout = Layout::from_size_align(page, page).unwrap();
        let wide = VirtualAllocator.allocate(layout).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(wide.as_ptr().cast::<u8>(), wide.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { VirtualAllocator.deallocate(wide.cast(), layout) };
    }

    #[test]
    fn test_realistic_sizes() {
        let page = page_size().unwrap();
        let alloc = VirtualAllocator;
        for mib in [1usize, 2, 4] {
            let size = mib * 1024 * 1024;
            let layout = Layout::from_size_align(size, page).unwrap();
            let wide = alloc.allocate(layout).unwrap();
            assert_eq!(0, wide.len() % page);
            assert!(wide.len() >= size);
            unsafe { alloc.deallocate(wide.cast(), layout) };
        }
    }
}
