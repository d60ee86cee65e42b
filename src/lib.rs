//! # viewcache - Bounded-View Page Cache Engine
//!
//! viewcache lets file-like streams of arbitrary size be accessed through a
//! small, fixed pool of mapped windows ("views"), while independently
//! tracking which byte ranges are pinned resident and which pages are dirty.
//! It is the cache *metadata* engine: the actual address-space work lives
//! behind a mapper trait, and the decision of *when* to write dirty data
//! back belongs to an external write-behind scheduler that consumes the
//! engine's dirty-stream scan.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                CacheEngine (facade)            │
//! ├──────────────┬────────────────┬───────────────┤
//! │ StreamRegistry│ PinnedBuffers │ DirtyAccountant│
//! │  (lifecycle)  │ (pins/overlay/ │  (counters +  │
//! │  clean/dirty  │   mask)        │   throttle)   │
//! ├──────────────┴────────┬───────┴───────────────┤
//! │      ViewPool (LRU, free list, steal)          │
//! │      + per-stream StreamIndex (flat/radix)     │
//! ├────────────────────────────────────────────────┤
//! │        ViewMapper trait (heap / file)          │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! A caller pins a range through the engine; the buffer table asks the
//! stream's index for views covering the needed windows; the index asks the
//! pool to supply or steal a mapped window; dirtiness flows into the
//! accountant; stream-level transitions flow into the registry.
//!
//! ## Guarantees
//!
//! - The pool is the only owner of mapped windows: total address-space
//!   consumption is `capacity × WINDOW_SIZE`, always.
//! - Every view is free, idle-on-LRU, or in-use; pinned views are never
//!   evicted.
//! - Global dirty pages == Σ per-stream dirty pages == Σ buffer/mask
//!   contributions, after every operation.
//! - No state survives the process: everything is rebuilt from the backing
//!   store.
//!
//! ## Quick Start
//!
//! ```ignore
//! use viewcache::{CacheEngine, CacheOptions, PinFlags, StreamSizes, UnpinAction};
//!
//! let engine = CacheEngine::in_memory(CacheOptions::default());
//! engine.initialize_stream(1, StreamSizes::exact(1 << 20), false, None, None)?;
//!
//! let pin = engine.prepare_for_write(1, 0, 4096, PinFlags::blocking(), false)?.unwrap();
//! engine.write_pinned(&pin, b"hello")?;
//! engine.unpin(pin, UnpinAction::Unpin)?;
//!
//! engine.flush_range(1, None, u64::MAX)?;
//! engine.uninitialize_stream(1, None)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: the public operation set and lock discipline
//! - [`view`]: the bounded global view pool (LRU reuse, theft, races)
//! - [`index`]: per-stream offset→view index (flat array or radix tree)
//! - [`buffer`]: pinned buffers, overlay handles, mask buffers
//! - [`accounting`]: dirty-page counters and write admission
//! - [`stream`]: stream objects, lifecycle, registry, teardown waiters
//! - [`mapper`]: the virtual-memory mapper seam and its two backends
//! - [`config`]: tunable constants with compile-time consistency checks

pub mod accounting;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod mapper;
pub mod stream;
pub mod view;

pub use buffer::{FileKey, OverlayBuffer, PinHandle, PinMode, UnpinAction};
pub use engine::{CacheEngine, CacheOptions, DirtyRange, DirtyTotals, FlushStats, PinFlags};
pub use error::CacheError;
pub use mapper::{FileMapper, HeapMapper, ViewMapper};
pub use stream::{Lifecycle, NoopHooks, StreamSizes, WriteBackHooks};
