//! # Virtual-Memory Mapper Abstraction
//!
//! This module provides the `ViewMapper` trait, the seam between the cache
//! engine and whatever creates and maps backing store. The engine never talks
//! to files or sections directly: it asks the mapper to create a mapping per
//! stream, then to map and unmap fixed-size windows of it on demand.
//!
//! ## Design Philosophy
//!
//! The cache core is pure bookkeeping: which windows are mapped, which
//! ranges are pinned, which pages are dirty. Everything that actually touches
//! address space sits behind this trait, which keeps the core testable with a
//! plain in-memory backend and lets real deployments plug in `mmap`-backed
//! storage without the core knowing.
//!
//! ## Copy-Based Data Plane
//!
//! Window contents are accessed through `read_window`/`write_window` rather
//! than raw slices. Windows of one logical range are not guaranteed to be
//! address-contiguous (each window is its own mapping), so a slice-based
//! interface could not span them anyway. Copy semantics also keep every
//! backend trivial to make `Sync`.
//!
//! ## Blocking Contract
//!
//! `map_window` and `unmap_window` may block (page-table work, disk I/O for
//! file-backed mappings). The engine guarantees it never calls them while
//! holding its pool lock; backends may take their own locks freely.
//!
//! ## Backends
//!
//! | Backend      | Backing            | Purge semantics          |
//! |--------------|--------------------|--------------------------|
//! | `HeapMapper` | `Vec<u8>` per map  | no-op (nothing cached)   |
//! | `FileMapper` | real file, memmap2 | no-op (file is truth)    |

mod file;
mod heap;

pub use file::FileMapper;
pub use heap::HeapMapper;

use eyre::Result;

/// Identifies one backing mapping (one per stream).
pub type MappingId = u64;

/// Opaque handle to one mapped window, valid until `unmap_window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowToken(pub(crate) u64);

/// A successfully mapped window.
#[derive(Debug, Clone, Copy)]
pub struct MappedWindow {
    pub token: WindowToken,
    /// Bytes actually mapped; the final window of a mapping maps short.
    pub len: usize,
}

/// The external virtual-memory mapper consumed by the cache engine.
///
/// All offsets handed to `map_window` are window-aligned and within the
/// mapping size. Implementations must be safe to call from many threads.
pub trait ViewMapper: Send + Sync {
    /// Creates a backing mapping of at least `size` bytes.
    fn create_mapping(&self, size: u64) -> Result<MappingId>;

    /// Grows an existing mapping to `new_size` bytes. Shrinking is never
    /// requested; a `new_size` at or below the current size is a no-op.
    fn extend_mapping(&self, mapping: MappingId, new_size: u64) -> Result<()>;

    /// Maps one window at `offset` (window-aligned). The returned length is
    /// `min(WINDOW_SIZE, mapping_size - offset)`.
    fn map_window(&self, mapping: MappingId, offset: u64) -> Result<MappedWindow>;

    /// Unmaps a window. `unmap_behind` hints that the caller is scanning
    /// forward sequentially and will not return to this window.
    fn unmap_window(&self, token: WindowToken, unmap_behind: bool);

    /// Copies `buf.len()` bytes out of a window starting at window-relative
    /// offset `at`.
    fn read_window(&self, token: WindowToken, at: usize, buf: &mut [u8]) -> Result<()>;

    /// Copies `data` into a window starting at window-relative offset `at`.
    fn write_window(&self, token: WindowToken, at: usize, data: &[u8]) -> Result<()>;

    /// Zeroes `len` bytes of a window starting at window-relative offset `at`.
    fn zero_window(&self, token: WindowToken, at: usize, len: usize) -> Result<()>;

    /// Flushes `[offset, offset + len)` of a mapping to the backing store.
    fn flush_mapping(&self, mapping: MappingId, offset: u64, len: u64) -> Result<()>;

    /// Discards any cached pages of `[offset, offset + len)` without writing
    /// them. Returns false if the backend could not discard everything.
    fn purge_mapping(&self, mapping: MappingId, offset: u64, len: u64) -> bool;

    /// Asks the backend to stop writing dirty pages behind the cache's back;
    /// the cache will drive all write-back explicitly.
    fn disable_writeback_tracking(&self, _mapping: MappingId) {}

    /// Re-enables backend-driven write-back after
    /// [`disable_writeback_tracking`](Self::disable_writeback_tracking).
    fn enable_writeback_tracking(&self, _mapping: MappingId) {}

    /// Destroys a mapping. All of its windows have been unmapped.
    fn delete_mapping(&self, mapping: MappingId);
}
