// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::args::FormatArg;
use crate::engine::format_sink;
use allocator_api2::alloc::{AllocError, Allocator};
use core::alloc::Layout;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use libdd_memview::sink::{OutputSink, SinkError};

/// Chunk bookkeeping, stored at the head of the chunk's own allocation
/// with the payload following at the configured alignment.
struct Chunk {
    payload: *mut u8,
    capacity: usize,
    used: usize,
    next: *mut Chunk,
    allocation_layout: Layout,
}

/// A byte builder that accumulates output into a chain of fixed-size
/// chunks from a caller allocator, never moving bytes once written.
///
/// Growing a contiguous buffer means abandoning the old allocation, which
/// an arena cannot reuse until it resets; chunking sidesteps that
/// entirely, so a single arena can back both a builder and everything
/// else a request allocates. The price is that the result is a sequence
/// of byte runs, exposed by [StringBuilder::chunks], not one slice;
/// [StringBuilder::concat_in] copies them out when contiguity is needed.
///
/// While this is called a string builder, the payload is plain bytes; the
/// typed `push_*` writers append host-endian encodings for binary
/// protocols just as happily as text.
///
/// The builder implements [OutputSink], so the format engine (and any
/// other sink-oriented producer) can write straight into it; that is what
/// [StringBuilder::format] does.
pub struct StringBuilder<A: Allocator> {
    head: *mut Chunk,
    /// The chunk currently accepting bytes. Chunks after it are empty
    /// leftovers from [StringBuilder::clear], reused before anything new
    /// is allocated.
    active: *mut Chunk,
    allocator: A,
    chunk_size: usize,
    chunk_align: usize,
    total: usize,
}

/// Default chunk payload capacity.
const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Default chunk payload alignment.
const DEFAULT_CHUNK_ALIGN: usize = 8;

unsafe impl<A: Allocator + Send> Send for StringBuilder<A> {}

impl<A: Allocator> StringBuilder<A> {
    /// Creates a builder with 1 KiB chunks aligned to 8 bytes. The first
    /// chunk is allocated eagerly, so allocator exhaustion surfaces here
    /// rather than on the first push.
    pub fn new(allocator: A) -> Result<Self, AllocError> {
        Self::with_chunk_size(allocator, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_ALIGN)
    }

    /// Creates a builder with a custom chunk capacity and payload
    /// alignment (a power of two; useful when consumers want to run SIMD
    /// over the chunks).
    pub fn with_chunk_size(
        allocator: A,
        chunk_size: usize,
        chunk_align: usize,
    ) -> Result<Self, AllocError> {
        if chunk_size == 0 || !chunk_align.is_power_of_two() {
            return Err(AllocError);
        }
        let mut this = Self {
            head: ptr::null_mut(),
            active: ptr::null_mut(),
            allocator,
            chunk_size,
            chunk_align,
            total: 0,
        };
        let first = this.allocate_chunk()?;
        this.head = first;
        this.active = first;
        Ok(this)
    }

    fn payload_offset(&self) -> usize {
        let align = self.chunk_align.max(align_of::<Chunk>());
        size_of::<Chunk>().div_ceil(align) * align
    }

    fn allocate_chunk(&self) -> Result<*mut Chunk, AllocError> {
        let offset = self.payload_offset();
        let size = offset.checked_add(self.chunk_size).ok_or(AllocError)?;
        let layout = Layout::from_size_align(size, self.chunk_align.max(align_of::<Chunk>()))
            .map_err(|_| AllocError)?;
        let allocation = self.allocator.allocate(layout)?;
        let base = allocation.as_ptr().cast::<u8>();
        let chunk = base.cast::<Chunk>();
        // SAFETY: the allocation starts Chunk-aligned and has room for the
        // header followed by the payload at `offset`.
        unsafe {
            chunk.write(Chunk {
                payload: base.add(offset),
                capacity: self.chunk_size,
                used: 0,
                next: ptr::null_mut(),
                allocation_layout: layout,
            });
        }
        Ok(chunk)
    }

    /// Total bytes pushed since construction or the last clear.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Appends all of `bytes`, filling the active chunk and then moving
    /// through empty successors or fresh allocations, `chunk_size` bytes
    /// at a time. On allocation failure the bytes copied so far remain in
    /// the builder.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), AllocError> {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            // SAFETY: active always points at a live chunk.
            let chunk = unsafe { &mut *self.active };
            let room = chunk.capacity - chunk.used;
            if room == 0 {
                if chunk.next.is_null() {
                    let fresh = self.allocate_chunk()?;
                    // SAFETY: re-borrow after the allocation; linking a
                    // fresh chunk after the (full) active one.
                    unsafe { (*self.active).next = fresh };
                    self.active = fresh;
                } else {
                    self.active = chunk.next;
                }
                continue;
            }
            let step = room.min(remaining.len());
            // SAFETY: [used, used + step) is within the chunk's payload.
            unsafe {
                ptr::copy_nonoverlapping(
                    remaining.as_ptr(),
                    chunk.payload.add(chunk.used),
                    step,
                );
            }
            chunk.used += step;
            self.total += step;
            remaining = &remaining[step..];
        }
        Ok(())
    }

    /// Appends a UTF-8 string's bytes.
    pub fn push_str(&mut self, value: &str) -> Result<(), AllocError> {
        self.push_bytes(value.as_bytes())
    }

    /// Appends one raw byte.
    pub fn push_u8(&mut self, value: u8) -> Result<(), AllocError> {
        self.push_bytes(&[value])
    }

    /// Appends one raw byte.
    pub fn push_i8(&mut self, value: i8) -> Result<(), AllocError> {
        self.push_bytes(&[value as u8])
    }

    /// Appends a bool as a `0`/`1` byte.
    pub fn push_bool(&mut self, value: bool) -> Result<(), AllocError> {
        self.push_u8(value as u8)
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_u16(&mut self, value: u16) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_i16(&mut self, value: i16) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_u32(&mut self, value: u32) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_i32(&mut self, value: i32) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_u64(&mut self, value: u64) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_i64(&mut self, value: i64) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_f32(&mut self, value: f32) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Appends the host-endian bytes of the value.
    pub fn push_f64(&mut self, value: f64) -> Result<(), AllocError> {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Formats straight into the builder with the engine's full verb
    /// vocabulary, returning the bytes appended (negative if a chunk
    /// allocation failed mid-way).
    pub fn format(&mut self, fmt: &[u8], args: &[FormatArg<'_>]) -> i64 {
        format_sink(self, fmt, args)
    }

    /// Empties the builder without returning chunks to the allocator:
    /// every chunk's cursor rewinds and subsequent pushes refill them in
    /// order.
    pub fn clear(&mut self) {
        let mut chunk = self.head;
        while !chunk.is_null() {
            // SAFETY: walking the live chain.
            unsafe {
                (*chunk).used = 0;
                chunk = (*chunk).next;
            }
        }
        self.active = self.head;
        self.total = 0;
    }

    /// Iterates the written bytes, one slice per non-empty chunk, in
    /// write order. Concatenating the yielded slices reproduces exactly
    /// what was pushed.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            current: self.head.cast_const(),
            _builder: PhantomData,
        }
    }

    /// Copies the whole contents into one contiguous allocation from
    /// `target`.
    pub fn concat_in<'t, B: Allocator>(&self, target: &'t B) -> Result<&'t mut [u8], AllocError> {
        if self.total == 0 {
            return Ok(&mut []);
        }
        let layout = Layout::array::<u8>(self.total).map_err(|_| AllocError)?;
        let allocation = target.allocate(layout)?;
        let base = allocation.as_ptr().cast::<u8>();
        let mut at = 0usize;
        for piece in self.chunks() {
            // SAFETY: the destination has exactly `total` bytes and the
            // chunk lengths sum to `total`.
            unsafe { ptr::copy_nonoverlapping(piece.as_ptr(), base.add(at), piece.len()) };
            at += piece.len();
        }
        debug_assert_eq!(self.total, at);
        // SAFETY: just initialized all `total` bytes.
        Ok(unsafe { core::slice::from_raw_parts_mut(base, self.total) })
    }
}

impl<A: Allocator> OutputSink for StringBuilder<A> {
    fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        match self.push_bytes(data) {
            Ok(()) => Ok(data.len()),
            Err(_) => Err(SinkError),
        }
    }
}

impl<A: Allocator> Drop for StringBuilder<A> {
    fn drop(&mut self) {
        let mut chunk = self.head;
        while !chunk.is_null() {
            // SAFETY: each chunk is returned exactly once, with the layout
            // it was allocated under; `next` is read out first.
            unsafe {
                let next = (*chunk).next;
                let layout = (*chunk).allocation_layout;
                self.allocator
                    .deallocate(NonNull::new_unchecked(chunk.cast::<u8>()), layout);
                chunk = next;
            }
        }
    }
}

/// Iterator over a builder's written chunks. See [StringBuilder::chunks].
pub struct Chunks<'b> {
    current: *const Chunk,
    _builder: PhantomData<&'b ()>,
}

impl<'b> Iterator for Chunks<'b> {
    type Item = &'b [u8];

    fn next(&mut self) -> Option<Self::Item> {
        while !self.current.is_null() {
            // SAFETY: chunks stay live and unmoved for the builder borrow.
            unsafe {
                let chunk = &*self.current;
                self.current = chunk.next;
                if chunk.used > 0 {
                    return Some(core::slice::from_raw_parts(chunk.payload, chunk.used));
                }
            }
        }
        None
    }
}
