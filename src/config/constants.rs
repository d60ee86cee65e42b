//! # viewcache Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! The following diagram shows how constants relate to each other. When changing
//! any constant, check if dependent constants need adjustment.
//!
//! ```text
//! PAGE_SHIFT (12)
//!       │
//!       ├─> PAGE_SIZE (derived: 1 << PAGE_SHIFT)
//!       │
//!       └─> WINDOW_SHIFT (18, must be > PAGE_SHIFT)
//!             │
//!             ├─> WINDOW_SIZE (derived: 1 << WINDOW_SHIFT = 256 KiB)
//!             │     The fixed mapping granularity. Every view covers exactly
//!             │     one window; pinned buffers never cross a window boundary.
//!             │
//!             ├─> PAGES_PER_WINDOW (derived: WINDOW_SIZE / PAGE_SIZE)
//!             │
//!             └─> LEVEL_SHIFT (7)
//!                   │
//!                   ├─> LEVEL_FANOUT (derived: 128 children per tree node)
//!                   │
//!                   ├─> FLAT_INDEX_MAX (derived: 1 << (WINDOW_SHIFT +
//!                   │     LEVEL_SHIFT) = 32 MiB). Streams at or below this
//!                   │     section size use a flat index; larger streams use
//!                   │     the multilevel radix tree.
//!                   │
//!                   └─> MAX_INDEX_LEVELS (derived: enough levels for 63-bit
//!                         offsets). Sizes the per-call node zone, so an index
//!                         insert can never allocate inside the pool lock.
//!
//! WRITE_CHARGE_CAP_PAGES (64)
//!       │
//!       └─> Caps the throttle charge of any single write request so one
//!           large write cannot starve behind the dirty threshold forever.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `WINDOW_SIZE` is a multiple of `PAGE_SIZE` (buffer page accounting
//!    assumes whole pages per window)
//! 2. `FLAT_INDEX_MAX == WINDOW_SIZE << LEVEL_SHIFT` (a one-level tree and a
//!    full flat index cover exactly the same range)
//! 3. `MAX_INDEX_LEVELS` covers 63 bits of file offset (offsets are `u64` but
//!    must stay `i64`-representable, see `MAX_STREAM_SIZE`)

/// Log2 of the page size. Dirty tracking, mask buffers and the write
/// throttle all count in these units.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a cache page in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Log2 of the view window size.
pub const WINDOW_SHIFT: u32 = 18;

/// Size of one mapped view window in bytes (256 KiB).
///
/// This is the fixed mapping granularity: the mapper is only ever asked to
/// map windows of this size (the final window of a stream may map short).
/// The value trades address-space consumption per view against map/unmap
/// churn for large sequential scans; it does not affect correctness.
pub const WINDOW_SIZE: u64 = 1 << WINDOW_SHIFT;

/// Number of pages covered by one window.
pub const PAGES_PER_WINDOW: usize = (WINDOW_SIZE as usize) / PAGE_SIZE;

/// Log2 of the radix-tree fanout: each tree level decodes this many bits of
/// the window number.
pub const LEVEL_SHIFT: u32 = 7;

/// Children per radix-tree node (128).
pub const LEVEL_FANOUT: usize = 1 << LEVEL_SHIFT;

/// Largest section size (in bytes) served by a flat one-level index.
/// Streams above this convert to the multilevel radix tree.
pub const FLAT_INDEX_MAX: u64 = 1 << (WINDOW_SHIFT + LEVEL_SHIFT);

/// Inline capacity of the flat index: streams of up to this many windows
/// (1 MiB of data) index their views without any heap allocation.
pub const INLINE_INDEX_SLOTS: usize = 4;

/// Maximum depth of the radix tree. Seven 7-bit levels on top of the 18-bit
/// window offset cover the full 63-bit offset range.
pub const MAX_INDEX_LEVELS: usize = ((63 - WINDOW_SHIFT as usize) / LEVEL_SHIFT as usize) + 1;

/// Default number of views in the global pool. Each view maps one window, so
/// the default address-space footprint is `64 * 256 KiB = 16 MiB`.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Per-request cap on the dirty-page charge considered by write admission.
/// A single huge write is charged at most this many pages so that it is
/// judged by the same yardstick as everyone else.
pub const WRITE_CHARGE_CAP_PAGES: usize = 64;

/// Fraction of total system RAM (as pages) used for the auto-detected
/// dirty-page threshold: dirty data may cover 1/8 of RAM before writes
/// start queueing.
pub const DIRTY_THRESHOLD_RAM_FRACTION: usize = 8;

/// Floor for the dirty-page threshold, in pages, when auto-detection runs on
/// a machine reporting implausibly little memory (1024 pages = 4 MiB).
pub const MIN_DIRTY_THRESHOLD_PAGES: usize = 1024;

/// How many whole windows a forward-scanning stream may keep mapped behind
/// its current position before the release-behind heuristic unmaps them.
pub const UNMAP_BEHIND_WINDOWS: u64 = 2;

/// Largest supported stream size. Offsets are carried as `u64` but must stay
/// representable as `i64` for parity with callers that do signed arithmetic
/// on file offsets.
pub const MAX_STREAM_SIZE: u64 = i64::MAX as u64;

const _: () = assert!(
    WINDOW_SIZE as usize % PAGE_SIZE == 0,
    "WINDOW_SIZE must be a whole number of pages"
);

const _: () = assert!(
    FLAT_INDEX_MAX == WINDOW_SIZE << LEVEL_SHIFT,
    "a full flat index and a one-level tree must cover the same range"
);

const _: () = assert!(
    WINDOW_SHIFT as usize + LEVEL_SHIFT as usize * MAX_INDEX_LEVELS >= 63,
    "MAX_INDEX_LEVELS must cover 63-bit offsets"
);

const _: () = assert!(
    INLINE_INDEX_SLOTS <= LEVEL_FANOUT,
    "inline slots cannot exceed one level's fanout"
);
