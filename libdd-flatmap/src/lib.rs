// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flat, open-addressed hash maps that allocate from a caller-supplied
//! [Allocator] and never touch the global heap on their own.
//!
//! Two core variants share one slot-table design:
//!
//! - [FixedMap] sizes its table once at construction and refuses inserts
//!   beyond the configured maximum. All memory is claimed up front, which
//!   pairs naturally with arena allocators.
//! - [GrowMap] keeps a configurable load factor and rehashes into a larger
//!   power-of-two table when an insert would cross it.
//!
//! On top of those, [StrMap] and [StrMultimap] specialize the table for
//! variable-length byte-string keys and values, with a per-side ownership
//! tag choosing between aliasing caller memory and copying into the map's
//! allocator.
//!
//! The table layout is parallel key/value arrays plus a one-bit-per-slot
//! occupancy word array, probed linearly from `hash & (len - 1)`. Hashing
//! is seeded: every constructor takes a 64-bit seed, and resistance to
//! hash flooding is exactly as good as the seed is unpredictable. Seed
//! from the OS random source and rotate across trust boundaries; a fixed
//! seed is fine for data you do not accept from an adversary.
//!
//! Nothing here is thread-safe; instances belong to one thread at a time.

pub mod hash;

mod error;
mod fixed;
mod grow;
mod multimap;
mod strmap;
mod table;

pub use error::MapError;
pub use fixed::FixedMap;
pub use grow::GrowMap;
pub use multimap::{PairIter, StrMultimap, ValueIter};
pub use strmap::{StrEntryIter, StrMap, StrSource};
pub use table::{Iter, IterCursor};

pub use libdd_alloc::Allocator;
