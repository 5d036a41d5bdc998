// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text and binary output assembly over caller allocators: a printf-
//! superset [format engine](format_sink) that streams through any
//! [OutputSink], and a chunked [StringBuilder] that collects output
//! without ever relocating written bytes.
//!
//! The two compose: the builder is itself a sink, so
//! [StringBuilder::format] runs the engine straight into the chunk chain,
//! and [format_in] materializes a formatted result as a single
//! allocation when that is what the caller wants.
//!
//! Floating-point output is correctly rounded from the exact binary
//! value (capped at 18 significant digits, then zero-filled), so printing
//! a double and parsing it back reproduces the bits.

mod args;
mod builder;
mod decimal;
mod engine;

pub use args::FormatArg;
pub use builder::{Chunks, StringBuilder};
pub use engine::{format_in, format_sink, set_separators, FormatError};

pub use libdd_memview::sink::{OutputSink, SinkError};
