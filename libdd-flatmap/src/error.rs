// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Failures reported by map constructors and inserts. Failed operations
/// never partially mutate a map: on error, the map is exactly as it was
/// before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// A fixed-capacity map is at its configured maximum item count.
    #[error("map is at its configured capacity")]
    CapacityExhausted,

    /// The backing allocator could not provide memory. For a growing map
    /// this aborts the rehash and leaves the previous table intact.
    #[error("backing allocator failed")]
    AllocationFailed,

    /// Load factor outside the open interval (0, 1).
    #[error("load factor must be between 0 and 1 exclusive")]
    InvalidLoadFactor,
}

impl From<libdd_alloc::AllocError> for MapError {
    fn from(_: libdd_alloc::AllocError) -> Self {
        MapError::AllocationFailed
    }
}
