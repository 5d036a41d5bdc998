// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::cell::Cell;

/// One argument to the format engine: the Rust stand-in for a C varargs
/// slot. Build a slice of these by hand or with [crate::fmt_args].
///
/// Numeric verbs read any numeric variant and then narrow or widen it
/// according to the conversion's length modifier, the way varargs
/// promotion plus a modifier would have. A verb that finds the wrong
/// variant (or no argument at all) renders `(ERROR)` instead of touching
/// memory it shouldn't.
#[derive(Clone, Copy, Debug)]
pub enum FormatArg<'a> {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Usize(usize),
    F64(f64),
    F32(f32),
    Char(char),
    Str(&'a str),
    Bytes(&'a [u8]),
    /// A pointer value for `%p`. Use [FormatArg::ptr] to build one.
    Ptr(usize),
    /// Receiver for `%n`: the engine stores the byte count produced so far
    /// into the cell.
    Count(&'a Cell<i64>),
    /// The null argument: renders `(ERROR)` under any verb, standing in
    /// for C's NULL string/pointer.
    Null,
}

impl<'a> FormatArg<'a> {
    /// Wraps a raw pointer's address for `%p`.
    pub fn ptr<T>(pointer: *const T) -> Self {
        FormatArg::Ptr(pointer as usize)
    }
}

macro_rules! impl_from {
    ($($variant:ident: $t:ty),* $(,)?) => {
        $(
            impl<'a> From<$t> for FormatArg<'a> {
                fn from(value: $t) -> Self {
                    FormatArg::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    I32: i32, I32: i16, I32: i8,
    U32: u32, U32: u16, U32: u8,
    I64: i64, U64: u64, Usize: usize,
    F64: f64, F32: f32,
    Char: char,
}

impl<'a> From<&'a str> for FormatArg<'a> {
    fn from(value: &'a str) -> Self {
        FormatArg::Str(value)
    }
}

impl<'a> From<&'a [u8]> for FormatArg<'a> {
    fn from(value: &'a [u8]) -> Self {
        FormatArg::Bytes(value)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for FormatArg<'a> {
    fn from(value: &'a [u8; N]) -> Self {
        FormatArg::Bytes(value)
    }
}

impl<'a> From<&'a Cell<i64>> for FormatArg<'a> {
    fn from(value: &'a Cell<i64>) -> Self {
        FormatArg::Count(value)
    }
}

/// Builds a `[FormatArg; N]` from plain values:
///
/// ```
/// use libdd_format::{fmt_args, format_sink};
/// use libdd_memview::sink::SliceSink;
///
/// let mut buf = [0u8; 64];
/// let mut sink = SliceSink::new(&mut buf);
/// let written = format_sink(&mut sink, b"%s: %d", &fmt_args!["answer", 42]);
/// assert_eq!(10, written);
/// ```
#[macro_export]
macro_rules! fmt_args {
    () => {{
        let no_args: [$crate::FormatArg<'static>; 0] = [];
        no_args
    }};
    ($($value:expr),+ $(,)?) => {
        [$($crate::FormatArg::from($value)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_impls() {
        assert!(matches!(FormatArg::from(5i16), FormatArg::I32(5)));
        assert!(matches!(FormatArg::from(5u8), FormatArg::U32(5)));
        assert!(matches!(FormatArg::from(5usize), FormatArg::Usize(5)));
        assert!(matches!(FormatArg::from(1.5f32), FormatArg::F32(_)));
        assert!(matches!(FormatArg::from("s"), FormatArg::Str("s")));
        assert!(matches!(FormatArg::from(b"b"), FormatArg::Bytes(b"b")));
    }

    #[test]
    fn test_args_macro() {
        let args = fmt_args![1, "two", 3.0];
        assert_eq!(3, args.len());
        let empty = fmt_args![];
        assert_eq!(0, empty.len());
    }

    #[test]
    fn test_ptr_constructor() {
        let x = 7u32;
        let arg = FormatArg::ptr(&x as *const u32);
        assert!(matches!(arg, FormatArg::Ptr(addr) if addr == &x as *const u32 as usize));
    }
}
