// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-range primitives shared by the allocation, container, and formatting
//! crates.
//!
//! A "view" here is nothing more than `&[u8]` / `&mut [u8]`: a pointer plus a
//! length, with the slicing, comparison, and search operations this crate
//! layers on top. Where `core` already provides an operation
//! (`starts_with`, `eq_ignore_ascii_case`, …) this crate does not duplicate
//! it; only the missing pieces live here:
//!
//! - write-cursor helpers for the buffer/writer pattern ([`written_len`],
//!   [`auto_slice`], [`advance`]),
//! - byte and substring search ([`index_of`], [`index_of_reverse`],
//!   [`count_byte`], [`find`]),
//! - ASCII integer parsing and whitespace stripping,
//! - path tail extraction ([`basename`], [`file_extension`]),
//! - the [`OutputSink`] write abstraction in [`sink`].
//!
//! All operations are strictly byte-oriented. Nothing here normalizes or
//! decodes Unicode, and none of the comparisons are constant-time, so they
//! must not be used for cryptographic equality.

#![cfg_attr(not(feature = "std"), no_std)]

mod num;
mod search;
pub mod sink;
mod view;

pub use num::*;
pub use search::find;
pub use sink::{OutputSink, SinkError};
pub use view::*;
