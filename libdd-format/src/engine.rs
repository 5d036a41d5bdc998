// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The format engine: a printf superset that streams into any
//! [OutputSink].
//!
//! Verbs: `d i u o x X b B` (integers, `b` binary), `f e E g G` (decimal
//! floats, correctly rounded), `a A` (hex floats, exact), `s` (string),
//! `c` (char), `p` (pointer), `y` (byte view, the equivalent of `%.*s`
//! over the bytes), `n` (length capture), `%%`. Flags: `- + space # 0 '`
//! plus the metric suffix family `$` (SI), `$$` (IEC), `$$$` (JEDEC) and
//! `_` (no space before the suffix). Width and precision accept `*`.
//! Length modifiers `hh h l ll j z t I I32 I64` narrow or widen integer
//! arguments.
//!
//! Anything malformed — unknown verb, missing argument, argument of the
//! wrong kind, the null argument — renders `(ERROR)` and formatting
//! continues.
//!
//! The thousands separator and decimal point are per-thread state set by
//! [set_separators]; grouping is applied per verb via the `'` flag.

use crate::args::FormatArg;
use crate::decimal::{self, Decimal, FloatKind, MAX_DIGITS};
use allocator_api2::alloc::Allocator;
use core::alloc::Layout;
use core::cell::Cell;
use libdd_memview::sink::{CountingSink, OutputSink, SliceSink};

/// Formatting failures surfaced by the allocating convenience entry point;
/// the sink entry points report failure through their return count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("backing allocator failed")]
    AllocationFailed,
}

thread_local! {
    static SEPARATORS: Cell<(u8, u8)> = const { Cell::new((b',', b'.')) };
}

/// Sets this thread's thousands separator and decimal point characters.
/// They start as `,` and `.`.
pub fn set_separators(thousands: u8, decimal_point: u8) {
    SEPARATORS.with(|cell| cell.set((thousands, decimal_point)));
}

fn separators() -> (u8, u8) {
    SEPARATORS.with(|cell| cell.get())
}

const ERROR_TEXT: &[u8] = b"(ERROR)";

/// Precision is clamped here so every number renders within a fixed-size
/// body buffer; the digits past [MAX_DIGITS] significant places are zeros
/// anyway.
const MAX_FLOAT_PRECISION: usize = 320;
const MAX_INT_PRECISION: usize = 128;

/// Staged writes; flushed to the sink as it fills. Keeps tiny pieces (a
/// sign here, two digits there) from turning into per-piece sink calls.
const SCRATCH: usize = 512;

struct Out<'s> {
    sink: &'s mut dyn OutputSink,
    staged: [u8; SCRATCH],
    staged_len: usize,
    total: i64,
    failed: bool,
}

impl<'s> Out<'s> {
    fn new(sink: &'s mut dyn OutputSink) -> Self {
        Self {
            sink,
            staged: [0; SCRATCH],
            staged_len: 0,
            total: 0,
            failed: false,
        }
    }

    fn flush(&mut self) {
        if self.staged_len > 0 && !self.failed {
            if self.sink.write_all(&self.staged[..self.staged_len]).is_err() {
                self.failed = true;
            }
        }
        self.staged_len = 0;
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.failed {
            return;
        }
        self.total += bytes.len() as i64;
        if bytes.len() >= SCRATCH {
            self.flush();
            if self.sink.write_all(bytes).is_err() {
                self.failed = true;
            }
            return;
        }
        if self.staged_len + bytes.len() > SCRATCH {
            self.flush();
        }
        self.staged[self.staged_len..self.staged_len + bytes.len()].copy_from_slice(bytes);
        self.staged_len += bytes.len();
    }

    fn push_byte(&mut self, byte: u8) {
        self.push(&[byte]);
    }

    fn pad(&mut self, byte: u8, mut count: usize) {
        let chunk = [byte; 64];
        while count > 0 {
            let step = count.min(chunk.len());
            self.push(&chunk[..step]);
            count -= step;
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum Modifier {
    ByteWidth,
    ShortWidth,
    #[default]
    IntWidth,
    LongWidth,
}

#[derive(Clone, Copy, Default)]
struct Spec {
    minus: bool,
    plus: bool,
    space: bool,
    hash: bool,
    zero: bool,
    group: bool,
    metric: u8,
    metric_nospace: bool,
    width: usize,
    precision: Option<usize>,
    modifier: Modifier,
}

impl Spec {
    fn sign_for(&self, negative: bool) -> Option<u8> {
        if negative {
            Some(b'-')
        } else if self.plus {
            Some(b'+')
        } else if self.space {
            Some(b' ')
        } else {
            None
        }
    }
}

/// Fixed-capacity assembly buffer for one converted value.
struct Body {
    buf: [u8; 768],
    len: usize,
}

impl Body {
    fn new() -> Self {
        Self {
            buf: [0; 768],
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.len < self.buf.len() {
            self.buf[self.len] = byte;
            self.len += 1;
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    fn truncate_trailing(&mut self, bytes: &[u8]) {
        while self.len > 0 && bytes.contains(&self.buf[self.len - 1]) {
            self.len -= 1;
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Lays the converted value into the stream: left padding (space or,
/// when permitted, zeros after the sign), sign, prefix, body, right
/// padding.
fn emit(out: &mut Out<'_>, spec: &Spec, sign: Option<u8>, prefix: &[u8], body: &[u8], zeros: bool) {
    let content = sign.map_or(0, |_| 1) + prefix.len() + body.len();
    let pad = spec.width.saturating_sub(content);
    let zero_pad = zeros && spec.zero && !spec.minus;

    if !spec.minus && !zero_pad {
        out.pad(b' ', pad);
    }
    if let Some(sign) = sign {
        out.push_byte(sign);
    }
    out.push(prefix);
    if zero_pad {
        out.pad(b'0', pad);
    }
    out.push(body);
    if spec.minus {
        out.pad(b' ', pad);
    }
}

fn take<'a, 'v>(args: &'a [FormatArg<'v>], index: &mut usize) -> Option<FormatArg<'v>> {
    let arg = args.get(*index).copied();
    if arg.is_some() {
        *index += 1;
    }
    arg
}

/// `*` width/precision argument.
fn star_arg(args: &[FormatArg<'_>], index: &mut usize) -> Option<i32> {
    match take(args, index)? {
        FormatArg::I32(v) => Some(v),
        FormatArg::U32(v) => Some(v as i32),
        FormatArg::I64(v) => Some(v as i32),
        FormatArg::U64(v) => Some(v as i32),
        FormatArg::Usize(v) => Some(v as i32),
        _ => None,
    }
}

fn signed_value(arg: FormatArg<'_>, modifier: Modifier) -> Option<i64> {
    let raw = match arg {
        FormatArg::I32(v) => v as i64,
        FormatArg::U32(v) => v as i64,
        FormatArg::I64(v) => v,
        FormatArg::U64(v) => v as i64,
        FormatArg::Usize(v) => v as i64,
        _ => return None,
    };
    Some(match modifier {
        Modifier::ByteWidth => raw as i8 as i64,
        Modifier::ShortWidth => raw as i16 as i64,
        Modifier::IntWidth => raw as i32 as i64,
        Modifier::LongWidth => raw,
    })
}

fn unsigned_value(arg: FormatArg<'_>, modifier: Modifier) -> Option<u64> {
    let raw = match arg {
        FormatArg::I32(v) => v as i64 as u64,
        FormatArg::U32(v) => v as u64,
        FormatArg::I64(v) => v as u64,
        FormatArg::U64(v) => v,
        FormatArg::Usize(v) => v as u64,
        _ => return None,
    };
    Some(match modifier {
        Modifier::ByteWidth => raw as u8 as u64,
        Modifier::ShortWidth => raw as u16 as u64,
        Modifier::IntWidth => raw as u32 as u64,
        Modifier::LongWidth => raw,
    })
}

fn float_value(arg: FormatArg<'_>) -> Option<f64> {
    match arg {
        FormatArg::F64(v) => Some(v),
        FormatArg::F32(v) => Some(v as f64),
        _ => None,
    }
}

/// Renders integer digits (with optional grouping, minimum digit count,
/// and grouped zero-padding toward a width target) right-to-left.
struct IntDigits {
    buf: [u8; 256],
    pos: usize,
}

impl IntDigits {
    fn render(
        mut magnitude: u64,
        base: u64,
        upper: bool,
        min_digits: usize,
        group: Option<u8>,
        pad_to: usize,
    ) -> Self {
        let table: &[u8; 16] = if upper {
            b"0123456789ABCDEF"
        } else {
            b"0123456789abcdef"
        };
        let group_every = if base == 10 { 3 } else { 4 };
        let mut this = Self {
            buf: [0; 256],
            pos: 256,
        };
        let mut digits = 0usize;
        loop {
            let done_value = magnitude == 0 && digits >= min_digits;
            let done_pad = 256 - this.pos >= pad_to;
            if (done_value && done_pad) || this.pos < 8 {
                break;
            }
            if !done_value || !done_pad {
                if let Some(sep) = group {
                    if digits > 0 && digits % group_every == 0 {
                        this.pos -= 1;
                        this.buf[this.pos] = sep;
                    }
                }
                this.pos -= 1;
                this.buf[this.pos] = table[(magnitude % base) as usize];
                magnitude /= base;
                digits += 1;
            }
        }
        this
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[self.pos..]
    }
}

fn write_int(
    out: &mut Out<'_>,
    spec: &Spec,
    magnitude: u64,
    sign: Option<u8>,
    base: u64,
    upper: bool,
    keep_lone_zero: bool,
) {
    let min_digits = match spec.precision {
        Some(0) if magnitude == 0 && !keep_lone_zero => 0,
        Some(p) => p.min(MAX_INT_PRECISION).max(keep_lone_zero as usize),
        None => 1,
    };

    let (thousands, _) = separators();
    let group = spec.group.then_some(thousands);

    // When grouping, width zeros must thread through the separators, so
    // the digit renderer absorbs the zero-padding itself.
    let grouped_zero_pad = spec.zero && !spec.minus && spec.precision.is_none() && group.is_some();
    let pad_to = if grouped_zero_pad {
        let prefix_len = prefix_for(spec, base, upper, magnitude).len();
        spec.width
            .saturating_sub(sign.map_or(0, |_| 1) + prefix_len)
            .min(240)
    } else {
        0
    };

    let digits = IntDigits::render(magnitude, base, upper, min_digits, group, pad_to);
    let prefix = prefix_for(spec, base, upper, magnitude);
    // Don't double the octal alternate prefix onto precision zeros.
    let prefix: &[u8] = if prefix == b"0" && digits.as_slice().first() == Some(&b'0') {
        b""
    } else {
        prefix
    };
    let zeros = spec.precision.is_none() && !grouped_zero_pad;
    emit(out, spec, sign, prefix, digits.as_slice(), zeros);
}

fn prefix_for(spec: &Spec, base: u64, upper: bool, magnitude: u64) -> &'static [u8] {
    if !spec.hash || magnitude == 0 && base != 8 {
        return b"";
    }
    match (base, upper) {
        (8, _) => b"0",
        (16, false) => b"0x",
        (16, true) => b"0X",
        (2, false) => b"0b",
        (2, true) => b"0B",
        _ => b"",
    }
}

/// The metric suffix tables for `$`, `$$`, and `$$$`.
fn metric_tables(dollars: u8) -> (f64, [&'static [u8]; 5]) {
    match dollars {
        1 => (1000.0, [b"", b"k", b"M", b"G", b"T"]),
        2 => (1024.0, [b"", b"Ki", b"Mi", b"Gi", b"Ti"]),
        _ => (1024.0, [b"", b"K", b"M", b"G", b"T"]),
    }
}

/// Fixed-point body from a rounded decimal. `d.len == 0` is a rounded-to-
/// zero value and renders as zero. Grouping applies to the integer part.
fn fixed_body(body: &mut Body, d: &Decimal, precision: usize, group: bool) {
    let (thousands, point) = separators();
    let dp = if d.len == 0 { 0 } else { d.exp10 };

    if dp <= 0 {
        body.push(b'0');
    } else {
        for j in 0..dp {
            let digit = if (j as usize) < d.len {
                d.digits[j as usize]
            } else {
                b'0'
            };
            body.push(digit);
            if group && j != dp - 1 && (dp - 1 - j) % 3 == 0 {
                body.push(thousands);
            }
        }
    }

    if precision > 0 {
        body.push(point);
        for i in 1..=precision as i64 {
            let idx = dp as i64 - 1 + i;
            let digit = if idx >= 0 && (idx as usize) < d.len {
                d.digits[idx as usize]
            } else {
                b'0'
            };
            body.push(digit);
        }
    }
}

/// Scientific body `d.dddde±XX`; `frac_digits` fractional digits, padded
/// positionally with zeros.
fn scientific_body(body: &mut Body, d: &Decimal, frac_digits: usize, upper: bool, min_exp_len: usize) {
    let (_, point) = separators();
    let lead = if d.len == 0 { b'0' } else { d.digits[0] };
    body.push(lead);
    if frac_digits > 0 {
        body.push(point);
        for i in 1..=frac_digits {
            let digit = if i < d.len { d.digits[i] } else { b'0' };
            body.push(digit);
        }
    }
    let exponent = if d.len == 0 { 0 } else { d.exp10 - 1 };
    body.push(if upper { b'E' } else { b'e' });
    body.push(if exponent < 0 { b'-' } else { b'+' });
    let digits = IntDigits::render(exponent.unsigned_abs() as u64, 10, false, min_exp_len, None, 0);
    body.extend(digits.as_slice());
}

fn special_body(kind: &FloatKind) -> Option<(&'static [u8], bool)> {
    match kind {
        FloatKind::Nan => Some((b"NaN", false)),
        FloatKind::Infinite { negative } => Some((b"Inf", *negative)),
        _ => None,
    }
}

fn write_fixed_float(out: &mut Out<'_>, spec: &Spec, value: f64) {
    let precision = spec.precision.unwrap_or(6).min(MAX_FLOAT_PRECISION);
    let kind = decimal::fractional_digits(value, precision);

    if let Some((text, negative)) = special_body(&kind) {
        emit(out, spec, spec.sign_for(negative), b"", text, false);
        return;
    }

    let (d, negative) = match kind {
        FloatKind::Zero { negative } => (
            Decimal {
                digits: [0; MAX_DIGITS],
                len: 0,
                exp10: 0,
                negative,
            },
            negative,
        ),
        FloatKind::Finite(d) => {
            let negative = d.negative;
            (d, negative)
        }
        _ => return,
    };

    let mut body = Body::new();
    fixed_body(&mut body, &d, precision, spec.group);
    emit(out, spec, spec.sign_for(negative), b"", body.as_slice(), true);
}

fn write_scientific_float(out: &mut Out<'_>, spec: &Spec, value: f64, upper: bool) {
    let precision = spec.precision.unwrap_or(6).min(MAX_FLOAT_PRECISION);
    let kind = decimal::significant_digits(value, precision.saturating_add(1).min(MAX_DIGITS + 1));

    if let Some((text, negative)) = special_body(&kind) {
        emit(out, spec, spec.sign_for(negative), b"", text, false);
        return;
    }

    let (d, negative) = match kind {
        FloatKind::Zero { negative } => (
            Decimal {
                digits: [0; MAX_DIGITS],
                len: 0,
                exp10: 1,
                negative,
            },
            negative,
        ),
        FloatKind::Finite(d) => {
            let negative = d.negative;
            (d, negative)
        }
        _ => return,
    };

    let mut body = Body::new();
    scientific_body(&mut body, &d, precision, upper, 2);
    emit(out, spec, spec.sign_for(negative), b"", body.as_slice(), true);
}

fn write_general_float(out: &mut Out<'_>, spec: &Spec, value: f64, upper: bool) {
    let p = spec.precision.unwrap_or(6).clamp(1, MAX_FLOAT_PRECISION);
    let kind = decimal::significant_digits(value, p.min(MAX_DIGITS));

    if let Some((text, negative)) = special_body(&kind) {
        // %g applies its precision to the special text too; that is how a
        // %.1g NaN comes out as just "N".
        let text = &text[..text.len().min(p)];
        emit(out, spec, spec.sign_for(negative), b"", text, false);
        return;
    }

    let (d, negative) = match kind {
        FloatKind::Zero { negative } => {
            emit(out, spec, spec.sign_for(negative), b"", b"0", true);
            return;
        }
        FloatKind::Finite(d) if d.len == 0 => {
            emit(out, spec, spec.sign_for(d.negative), b"", b"0", true);
            return;
        }
        FloatKind::Finite(d) => {
            let negative = d.negative;
            (d, negative)
        }
        _ => return,
    };

    let exponent = d.exp10 - 1;
    let mut body = Body::new();
    if exponent < -4 || exponent >= p as i32 {
        // Scientific form, insignificant zeros dropped.
        let frac = d.len.saturating_sub(1);
        scientific_body(&mut body, &d, frac, upper, 2);
    } else {
        // Fixed form with only the significant fractional digits.
        let frac = (d.len as i32 - d.exp10).max(0) as usize;
        fixed_body(&mut body, &d, frac, spec.group);
    }
    emit(out, spec, spec.sign_for(negative), b"", body.as_slice(), true);
}

fn write_hex_float(out: &mut Out<'_>, spec: &Spec, value: f64, upper: bool) {
    if value.is_nan() || value.is_infinite() {
        let negative = value.is_sign_negative();
        let text: &[u8] = if value.is_nan() { b"NaN" } else { b"Inf" };
        emit(out, spec, spec.sign_for(negative), b"", text, false);
        return;
    }

    let bits = value.to_bits();
    let negative = bits >> 63 != 0;
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let mut fraction = bits & ((1u64 << 52) - 1);
    let mut lead: u8 = if biased == 0 { 0 } else { 1 };
    let exponent = if biased == 0 {
        if fraction == 0 {
            0 // true zero renders as 0x0p+0
        } else {
            -1022
        }
    } else {
        biased - 1023
    };

    // 13 hex digits hold the full 52 fraction bits; the default
    // precision matches the decimal verbs' 6.
    let precision = match spec.precision {
        Some(p) => p.min(64),
        None => 6,
    };

    if precision < 13 {
        // Round half-up at the cut nibble; the carry can ripple into the
        // leading digit (that is how a subnormal can print with lead 1).
        let shift = 4 * (13 - precision) - 1;
        fraction += 1u64 << shift;
        if fraction >> 52 != 0 {
            fraction &= (1u64 << 52) - 1;
            lead += 1;
        }
    }

    let table: &[u8; 16] = if upper {
        b"0123456789ABCDEF"
    } else {
        b"0123456789abcdef"
    };

    let mut body = Body::new();
    body.extend(b"0x");
    body.push(b'0' + lead);
    let frac_digits = precision.min(13);
    if precision > 0 {
        let (_, point) = separators();
        body.push(point);
        for i in 0..frac_digits {
            let nibble = (fraction >> (48 - 4 * i)) & 0xf;
            body.push(table[nibble as usize]);
        }
        for _ in frac_digits..precision {
            body.push(b'0');
        }
    }
    body.push(if upper { b'P' } else { b'p' });
    body.push(if exponent < 0 { b'-' } else { b'+' });
    let digits = IntDigits::render(exponent.unsigned_abs() as u64, 10, false, 1, None, 0);
    body.extend(digits.as_slice());

    emit(out, spec, spec.sign_for(negative), b"", body.as_slice(), true);
}

/// The `$` family: scale the value down by SI/IEC steps, format with one
/// trimmed decimal (or the explicit precision untrimmed), append the
/// suffix.
fn write_metric(out: &mut Out<'_>, spec: &Spec, value: f64) {
    let (divisor, suffixes) = metric_tables(spec.metric);
    let mut scaled = value;
    let mut index = 0usize;
    while scaled.abs() >= divisor && index < suffixes.len() - 1 {
        scaled /= divisor;
        index += 1;
    }

    let (precision, trim) = match spec.precision {
        Some(p) => (p.min(MAX_FLOAT_PRECISION), false),
        None => (1, true),
    };

    let kind = decimal::fractional_digits(scaled, precision);
    let (d, negative) = match kind {
        FloatKind::Finite(d) => {
            let negative = d.negative;
            (d, negative)
        }
        FloatKind::Zero { negative } => (
            Decimal {
                digits: [0; MAX_DIGITS],
                len: 0,
                exp10: 0,
                negative,
            },
            negative,
        ),
        _ => {
            let (text, negative) = special_body(&kind).unwrap_or((b"NaN", false));
            emit(out, spec, spec.sign_for(negative), b"", text, false);
            return;
        }
    };

    let mut body = Body::new();
    fixed_body(&mut body, &d, precision, spec.group);
    if trim {
        let (_, point) = separators();
        body.truncate_trailing(b"0");
        body.truncate_trailing(&[point]);
    }
    let suffix = suffixes[index];
    if !suffix.is_empty() {
        if !spec.metric_nospace {
            body.push(b' ');
        }
        body.extend(suffix);
    }
    emit(out, spec, spec.sign_for(negative), b"", body.as_slice(), false);
}

/// Formats `fmt` with `args` into `sink`, returning the number of bytes
/// produced, or a negative count if the sink rejected a write (output up
/// to that point may have been emitted).
pub fn format_sink(sink: &mut dyn OutputSink, fmt: &[u8], args: &[FormatArg<'_>]) -> i64 {
    let mut out = Out::new(sink);
    let mut arg_index = 0usize;
    let mut i = 0usize;

    while i < fmt.len() {
        let literal_start = i;
        while i < fmt.len() && fmt[i] != b'%' {
            i += 1;
        }
        if i > literal_start {
            out.push(&fmt[literal_start..i]);
        }
        if i >= fmt.len() {
            break;
        }
        i += 1; // consume '%'

        if fmt.get(i) == Some(&b'%') {
            out.push_byte(b'%');
            i += 1;
            continue;
        }

        let mut spec = Spec::default();
        loop {
            match fmt.get(i) {
                Some(b'-') => spec.minus = true,
                Some(b'+') => spec.plus = true,
                Some(b' ') => spec.space = true,
                Some(b'#') => spec.hash = true,
                Some(b'0') => spec.zero = true,
                Some(b'\'') => spec.group = true,
                Some(b'$') => spec.metric += 1,
                Some(b'_') => spec.metric_nospace = true,
                _ => break,
            }
            i += 1;
        }

        if fmt.get(i) == Some(&b'*') {
            i += 1;
            match star_arg(args, &mut arg_index) {
                Some(w) if w < 0 => {
                    spec.minus = true;
                    spec.width = w.unsigned_abs() as usize;
                }
                Some(w) => spec.width = w as usize,
                None => {}
            }
        } else {
            while let Some(c) = fmt.get(i).copied().filter(u8::is_ascii_digit) {
                spec.width = spec.width.saturating_mul(10) + (c - b'0') as usize;
                i += 1;
            }
        }

        if fmt.get(i) == Some(&b'.') {
            i += 1;
            if fmt.get(i) == Some(&b'*') {
                i += 1;
                spec.precision = star_arg(args, &mut arg_index)
                    .and_then(|p| usize::try_from(p).ok());
            } else {
                let mut p = 0usize;
                while let Some(c) = fmt.get(i).copied().filter(u8::is_ascii_digit) {
                    p = p.saturating_mul(10) + (c - b'0') as usize;
                    i += 1;
                }
                spec.precision = Some(p);
            }
        }

        spec.modifier = match fmt.get(i) {
            Some(b'h') => {
                i += 1;
                if fmt.get(i) == Some(&b'h') {
                    i += 1;
                    Modifier::ByteWidth
                } else {
                    Modifier::ShortWidth
                }
            }
            Some(b'l') => {
                i += 1;
                if fmt.get(i) == Some(&b'l') {
                    i += 1;
                }
                Modifier::LongWidth
            }
            Some(b'j') | Some(b'z') | Some(b't') => {
                i += 1;
                Modifier::LongWidth
            }
            Some(b'I') => {
                i += 1;
                if fmt[i..].starts_with(b"64") {
                    i += 2;
                    Modifier::LongWidth
                } else if fmt[i..].starts_with(b"32") {
                    i += 2;
                    Modifier::IntWidth
                } else {
                    Modifier::LongWidth
                }
            }
            _ => Modifier::IntWidth,
        };

        let Some(&verb) = fmt.get(i) else {
            out.push(ERROR_TEXT);
            break;
        };
        i += 1;

        match verb {
            b'd' | b'i' => match take(args, &mut arg_index).and_then(|a| signed_value(a, spec.modifier)) {
                Some(v) if spec.metric > 0 => write_metric(&mut out, &spec, v as f64),
                Some(v) => {
                    let sign = spec.sign_for(v < 0);
                    write_int(&mut out, &spec, v.unsigned_abs(), sign, 10, false, true);
                }
                None => out.push(ERROR_TEXT),
            },
            b'u' | b'o' | b'x' | b'X' | b'b' | b'B' => {
                match take(args, &mut arg_index).and_then(|a| unsigned_value(a, spec.modifier)) {
                    Some(v) if spec.metric > 0 => write_metric(&mut out, &spec, v as f64),
                    Some(v) => {
                        let (base, upper) = match verb {
                            b'u' => (10, false),
                            b'o' => (8, false),
                            b'x' => (16, false),
                            b'X' => (16, true),
                            b'b' => (2, false),
                            _ => (2, true),
                        };
                        write_int(&mut out, &spec, v, None, base, upper, false);
                    }
                    None => out.push(ERROR_TEXT),
                }
            }
            b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => {
                match take(args, &mut arg_index).and_then(float_value) {
                    Some(v) if spec.metric > 0 => write_metric(&mut out, &spec, v),
                    Some(v) => match verb {
                        b'f' | b'F' => write_fixed_float(&mut out, &spec, v),
                        b'e' | b'E' => write_scientific_float(&mut out, &spec, v, verb == b'E'),
                        b'g' | b'G' => write_general_float(&mut out, &spec, v, verb == b'G'),
                        _ => write_hex_float(&mut out, &spec, v, verb == b'A'),
                    },
                    None => out.push(ERROR_TEXT),
                }
            }
            b's' | b'y' => match take(args, &mut arg_index) {
                Some(FormatArg::Str(s)) => {
                    let bytes = s.as_bytes();
                    let bytes = &bytes[..spec.precision.unwrap_or(bytes.len()).min(bytes.len())];
                    emit(&mut out, &spec, None, b"", bytes, false);
                }
                Some(FormatArg::Bytes(b)) => {
                    let bytes = &b[..spec.precision.unwrap_or(b.len()).min(b.len())];
                    emit(&mut out, &spec, None, b"", bytes, false);
                }
                _ => out.push(ERROR_TEXT),
            },
            b'c' => match take(args, &mut arg_index) {
                Some(FormatArg::Char(c)) => {
                    let mut utf8 = [0u8; 4];
                    emit(&mut out, &spec, None, b"", c.encode_utf8(&mut utf8).as_bytes(), false);
                }
                _ => out.push(ERROR_TEXT),
            },
            b'p' => match take(args, &mut arg_index) {
                Some(FormatArg::Ptr(addr)) => {
                    let mut pspec = spec;
                    pspec.precision = Some(2 * core::mem::size_of::<usize>());
                    write_int(&mut out, &pspec, addr as u64, None, 16, false, true);
                }
                Some(FormatArg::Null) => {
                    let mut pspec = spec;
                    pspec.precision = Some(2 * core::mem::size_of::<usize>());
                    write_int(&mut out, &pspec, 0, None, 16, false, true);
                }
                _ => out.push(ERROR_TEXT),
            },
            b'n' => match take(args, &mut arg_index) {
                Some(FormatArg::Count(cell)) => cell.set(out.total),
                _ => out.push(ERROR_TEXT),
            },
            _ => out.push(ERROR_TEXT),
        }
    }

    out.flush();
    if out.failed {
        -1
    } else {
        out.total
    }
}

/// Formats into memory from `allocator`, returning the formatted bytes.
/// The output length is measured with a counting pass first, so exactly
/// one allocation of exactly the right size happens.
pub fn format_in<'a, A: Allocator>(
    allocator: &'a A,
    fmt: &[u8],
    args: &[FormatArg<'_>],
) -> Result<&'a mut [u8], FormatError> {
    let mut counter = CountingSink::new();
    let total = format_sink(&mut counter, fmt, args);
    debug_assert!(total >= 0, "counting sink cannot fail");
    let len = total.max(0) as usize;
    if len == 0 {
        return Ok(&mut []);
    }

    let layout = Layout::array::<u8>(len).map_err(|_| FormatError::AllocationFailed)?;
    let wide = allocator
        .allocate(layout)
        .map_err(|_| FormatError::AllocationFailed)?;
    // SAFETY: fresh allocation of len writable bytes; filled before return.
    let buf = unsafe { core::slice::from_raw_parts_mut(wide.as_ptr().cast::<u8>(), len) };
    let mut sink = SliceSink::new(buf);
    format_sink(&mut sink, fmt, args);
    // SAFETY: re-derive the slice; the SliceSink borrow has ended.
    Ok(unsafe { core::slice::from_raw_parts_mut(wide.as_ptr().cast::<u8>(), len) })
}
