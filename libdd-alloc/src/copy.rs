// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::{AllocError, Allocator, ChainAllocator, LinearAllocator};
use core::alloc::Layout;

/// A trait that indicates an allocator is an arena allocator, meaning it
/// doesn't reclaim individual items; their memory comes back as a group
/// when the arena is reset or dropped. That property is what makes it safe
/// to hand out plain shared references to copied-in bytes: nothing frees
/// them behind the reference's back.
pub trait ArenaAllocator: Allocator {
    /// Copies the bytes into the arena, returning the arena-owned copy.
    ///
    /// The returned reference borrows the arena, so the copy cannot outlive
    /// it, and the arena cannot be reset (`&mut self`) while the reference
    /// is live.
    fn copy_bytes(&self, bytes: &[u8]) -> Result<&[u8], AllocError> {
        if bytes.is_empty() {
            return Ok(&[]);
        }
        let layout = Layout::for_value(bytes);
        let uninit = Allocator::allocate(self, layout)?;

        // SAFETY: a fresh allocation cannot overlap the source, and it has
        // at least `bytes.len()` writable bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                uninit.as_ptr().cast::<u8>(),
                bytes.len(),
            );
        }

        // SAFETY: just initialized, alignment 1, length matches; lifetime is
        // narrowed to the arena borrow per the method signature.
        Ok(unsafe { core::slice::from_raw_parts(uninit.as_ptr().cast::<u8>(), bytes.len()) })
    }

    /// Copies the string into the arena. See [ArenaAllocator::copy_bytes].
    fn copy_str(&self, value: &str) -> Result<&str, AllocError> {
        let bytes = self.copy_bytes(value.as_bytes())?;
        // SAFETY: copied verbatim from a valid str.
        Ok(unsafe { core::str::from_utf8_unchecked(bytes) })
    }
}

impl<A: Allocator> ArenaAllocator for LinearAllocator<A> {}
impl<A: Allocator + Clone> ArenaAllocator for ChainAllocator<A> {}

#[cfg(test)]
mod tests {
    use super::*;
    use allocator_api2::alloc::Global;

    #[test]
    fn test_copy_bytes_round_trip() {
        let arena = ChainAllocator::new_in(4096, Global);
        let copy = arena.copy_bytes(b"some payload").unwrap();
        assert_eq!(b"some payload", copy);

        let empty = arena.copy_bytes(b"").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_copy_str() {
        let arena =
            LinearAllocator::new_in(Layout::from_size_align(256, 8).unwrap(), Global).unwrap();
        let copy = arena.copy_str("caché").unwrap();
        assert_eq!("caché", copy);
    }

    #[test]
    fn test_copies_are_independent() {
        let arena = ChainAllocator::new_in(4096, Global);
        let mut source = *b"mutable source";
        let copy = arena.copy_bytes(&source).unwrap();
        source.fill(b'x');
        assert_eq!(b"mutable source", copy);
    }

    #[test]
    fn fuzz_copy_bytes() {
        bolero::check!()
            .with_type::<(usize, Vec<Vec<u8>>)>()
            .for_each(|(size_hint, inputs)| {
                if *size_hint > 4 * 1024 * 1024 * 1024 {
                    return;
                }
                let arena = ChainAllocator::new_in(*size_hint, Global);
                let mut copies = Vec::new();
                for input in inputs {
                    let copy = arena.copy_bytes(input).expect("arena copy to succeed");
                    assert_eq!(input.as_slice(), copy);
                    copies.push(copy);
                }
                // Earlier copies survive later allocations.
                for (input, copy) in inputs.iter().zip(copies.iter()) {
                    assert_eq!(input.as_slice(), *copy);
                }
            });
    }
}
