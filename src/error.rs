//! # Cache Error Taxonomy
//!
//! Typed failures surfaced by the cache engine. All fallible operations
//! return `eyre::Result`; the variants below are the stable, matchable core
//! that rides inside the report. Callers that care which failure occurred
//! downcast with `report.downcast_ref::<CacheError>()`.
//!
//! Non-blocking calls never surface `WouldBlock` as an error: they return
//! `Ok(None)` (pin paths) or `false` (admission paths) instead. The variant
//! exists for internal propagation between layers.

use std::time::Duration;

/// Typed failures of the cache engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The view pool (or an internal allocation) is exhausted and no victim
    /// was eligible for reuse.
    ResourceExhausted {
        resource: &'static str,
        capacity: usize,
    },

    /// A non-blocking call could not complete without waiting.
    WouldBlock,

    /// A stream size or access offset exceeds the representable range.
    SizeTooLarge { requested: u64, limit: u64 },

    /// The underlying virtual-memory mapper failed; carries the mapper's own
    /// description. All mapper errors are normalized to this variant.
    MappingFailed { operation: &'static str },

    /// An internal invariant was violated. Always accompanied by a
    /// `debug_assert!`; in release builds the operation fails instead of
    /// corrupting cache state.
    InconsistentState { detail: &'static str },

    /// A wait for stream teardown expired before teardown completed.
    TeardownTimeout { waited: Duration },
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::ResourceExhausted { resource, capacity } => {
                write!(
                    f,
                    "{} exhausted: all {} entries are in use and none is eligible for reuse",
                    resource, capacity
                )
            }
            CacheError::WouldBlock => {
                write!(f, "operation would block and the caller asked not to wait")
            }
            CacheError::SizeTooLarge { requested, limit } => {
                write!(
                    f,
                    "requested size {} exceeds the representable limit {}",
                    requested, limit
                )
            }
            CacheError::MappingFailed { operation } => {
                write!(f, "virtual-memory mapper failed during {}", operation)
            }
            CacheError::InconsistentState { detail } => {
                write!(f, "internal cache state is inconsistent: {}", detail)
            }
            CacheError::TeardownTimeout { waited } => {
                write!(
                    f,
                    "stream teardown did not complete within {:?}",
                    waited
                )
            }
        }
    }
}

impl std::error::Error for CacheError {}
