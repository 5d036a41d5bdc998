// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The output sink abstraction.
//!
//! An [`OutputSink`] is the single channel through which byte-producing code
//! (the format engine, the string builder, serializers) hands data to a
//! consumer it knows nothing about: a stack buffer, a growing builder, a
//! file, a socket wrapper.
//!
//! The contract is deliberately small. A sink accepts a byte slice and
//! reports how many bytes it took, or that the rest of this logical output
//! is unusable. Everything else — blocking behavior, retries, chunking very
//! large writes, backpressure, flushing, closing — belongs to the sink
//! implementation, not to the interface. The bytes handed to [`write`] are
//! only valid for the duration of the call; a sink that wants to keep them
//! must copy.
//!
//! [`write`]: OutputSink::write

use core::fmt;

/// The downstream consumer rejected the write; the remainder of this logical
/// output is unusable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkError;

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("output sink rejected the write")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SinkError {}

/// A destination for produced bytes. See the [module docs](self).
pub trait OutputSink {
    /// Accepts as much of `data` as the sink can take right now.
    ///
    /// An empty `data` is a no-op returning `Ok(0)`. `Ok(n)` with
    /// `n < data.len()` is a short write: the sink is out of room but prior
    /// output is intact. `Err` poisons the remainder of the logical output.
    fn write(&mut self, data: &[u8]) -> Result<usize, SinkError>;

    /// Writes the whole of `data`, looping over short writes. A sink that
    /// stops making progress turns into an error, since the output can
    /// never complete.
    fn write_all(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let n = self.write(remaining)?;
            if n == 0 {
                return Err(SinkError);
            }
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Writes one raw byte.
    fn write_u8(&mut self, value: u8) -> Result<(), SinkError> {
        self.write_all(&[value])
    }

    /// Writes one raw byte.
    fn write_i8(&mut self, value: i8) -> Result<(), SinkError> {
        self.write_all(&[value as u8])
    }

    /// Writes a bool as a single `0`/`1` byte.
    fn write_bool(&mut self, value: bool) -> Result<(), SinkError> {
        self.write_u8(value as u8)
    }

    /// Writes the host-endian bytes of the value.
    fn write_u16(&mut self, value: u16) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }

    /// Writes the host-endian bytes of the value.
    fn write_i16(&mut self, value: i16) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }

    /// Writes the host-endian bytes of the value.
    fn write_u32(&mut self, value: u32) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }

    /// Writes the host-endian bytes of the value.
    fn write_i32(&mut self, value: i32) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }

    /// Writes the host-endian bytes of the value.
    fn write_u64(&mut self, value: u64) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }

    /// Writes the host-endian bytes of the value.
    fn write_i64(&mut self, value: i64) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }

    /// Writes the host-endian bytes of the value.
    fn write_f32(&mut self, value: f32) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }

    /// Writes the host-endian bytes of the value.
    fn write_f64(&mut self, value: f64) -> Result<(), SinkError> {
        self.write_all(&value.to_ne_bytes())
    }
}

impl<S: OutputSink + ?Sized> OutputSink for &mut S {
    fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        (**self).write(data)
    }
}

/// Sink over a fixed byte buffer. Fills from the front and takes short
/// writes once full; it never errors.
pub struct SliceSink<'a> {
    buf: &'a mut [u8],
    written: usize,
}

impl<'a> SliceSink<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, written: 0 }
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Room left in the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.written
    }

    /// The filled prefix of the buffer.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.written]
    }
}

impl OutputSink for SliceSink<'_> {
    fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        let n = data.len().min(self.remaining());
        self.buf[self.written..self.written + n].copy_from_slice(&data[..n]);
        self.written += n;
        Ok(n)
    }
}

/// Sink that discards everything and counts it. Used for measuring how long
/// formatted output would be without producing it.
#[derive(Default)]
pub struct CountingSink {
    count: u64,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl OutputSink for CountingSink {
    fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        self.count += data.len() as u64;
        Ok(data.len())
    }
}

/// Adapter turning any [`std::io::Write`] into a sink. Write errors map to
/// [`SinkError`]; the io error itself is retained for inspection.
///
/// Flushing and closing remain the caller's responsibility, per the sink
/// contract. Wrap the writer in [`std::io::BufWriter`] when issuing many
/// small writes to something unbuffered.
#[cfg(feature = "std")]
pub struct IoSink<W: std::io::Write> {
    inner: W,
    error: Option<std::io::Error>,
}

#[cfg(feature = "std")]
impl<W: std::io::Write> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    /// The io error behind the most recent [`SinkError`], if any.
    pub fn last_error(&self) -> Option<&std::io::Error> {
        self.error.as_ref()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(feature = "std")]
impl<W: std::io::Write> OutputSink for IoSink<W> {
    fn write(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        if data.is_empty() {
            return Ok(0);
        }
        match self.inner.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.error = Some(e);
                Err(SinkError)
            }
        }
    }
}
