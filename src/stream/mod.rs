//! # Stream Objects
//!
//! A `Stream` is the engine's per-cached-file object: it owns the buffer
//! table, the size/flag/lifecycle state, the per-stream dirty counter and the
//! view-visibility lock. The stream's view index lives in the pool (under the
//! pool lock); everything else lives here.
//!
//! ## Lifecycle
//!
//! ```text
//! (registry placeholder) ──> Active ──┬──> Deleting ──> Gone
//!                                     │
//!                                     └──> LazyDelete ──> Deleting ──> Gone
//! ```
//!
//! The placeholder stage is the registry's creation-collision entry (§
//! registry); a constructed `Stream` starts `Active`. The last close with no
//! dirty data tears down synchronously (`Deleting`); with dirty data the
//! stream parks in `LazyDelete` on the dirty list and the write-behind path
//! finishes the job once it comes clean.
//!
//! ## Lock Roles
//!
//! - `state` mutex: open count, sizes, flags, lifecycle. Always the innermost
//!   of the stream's locks.
//! - `buffers` mutex + condvar: the pinned-buffer table; pin admission waits
//!   park on the condvar.
//! - `visibility` rwlock: pin/map/dirty-note paths hold it shared; purge,
//!   truncate and teardown hold it exclusive so an "is this mapped" check
//!   can never interleave with a full-stream unmap.

pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffer::{BufferTable, FileKey};
use crate::mapper::MappingId;
use crate::view::StreamId;

/// The three sizes a filesystem maintains for a cached stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSizes {
    /// Space reserved for the stream; the section is sized to cover it.
    pub allocation_size: u64,
    /// Current end of file.
    pub file_size: u64,
    /// Highest byte known written; maintained for the caller, not
    /// interpreted by the cache.
    pub valid_data_length: u64,
}

impl StreamSizes {
    pub fn new(allocation_size: u64, file_size: u64, valid_data_length: u64) -> Self {
        Self {
            allocation_size,
            file_size,
            valid_data_length,
        }
    }

    /// Sizes for a simple file of `len` bytes.
    pub fn exact(len: u64) -> Self {
        Self::new(len, len, len)
    }
}

/// Post-construction lifecycle states. The creation-collision stage is a
/// registry placeholder, not a constructed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    /// Last handle closed with dirty data; teardown deferred to write-behind.
    LazyDelete,
    /// Teardown in progress.
    Deleting,
    /// Torn down; only stale references see this.
    Gone,
}

/// Callbacks consumed around write-back, provided per stream at
/// initialization. The default implementation accepts everything.
pub trait WriteBackHooks: Send + Sync {
    /// Deadlock-avoidance hook taken before flushing a stream's dirty data.
    /// Returning false skips this stream for now.
    fn acquire_for_lazy_write(&self, _file: FileKey) -> bool {
        true
    }

    /// Pairs with a successful [`acquire_for_lazy_write`](Self::acquire_for_lazy_write).
    fn release_from_lazy_write(&self, _file: FileKey) {}

    /// Invoked with the newest write-sequence about to be flushed, so the
    /// caller's log can be forced ahead of the data.
    fn flush_to_sequence(&self, _seq: u64) {}
}

/// The do-nothing hook set.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl WriteBackHooks for NoopHooks {}

#[derive(Debug)]
pub(crate) struct StreamState {
    pub open_count: u32,
    pub sizes: StreamSizes,
    /// Bytes the backing mapping covers; window-rounded, never shrinks.
    pub section_size: u64,
    pub lifecycle: Lifecycle,
    /// Stream is accessed exclusively through pin interfaces; unpinned
    /// write notes are rejected.
    pub pin_access: bool,
    /// Truncation requested at last close, applied during deferred teardown.
    pub truncate_pending: Option<u64>,
    /// A flush of this stream has been queued to the write-behind path.
    pub write_queued: bool,
}

/// Per-cached-file object.
pub struct Stream {
    id: StreamId,
    file: FileKey,
    mapping: MappingId,
    log_handle: Option<u64>,
    hooks: std::sync::Arc<dyn WriteBackHooks>,
    pub(crate) state: Mutex<StreamState>,
    pub(crate) buffers: Mutex<BufferTable>,
    pub(crate) buffer_cv: Condvar,
    pub(crate) visibility: RwLock<()>,
    dirty_pages: AtomicU64,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        file: FileKey,
        mapping: MappingId,
        sizes: StreamSizes,
        section_size: u64,
        pin_access: bool,
        hooks: std::sync::Arc<dyn WriteBackHooks>,
        log_handle: Option<u64>,
    ) -> Self {
        Self {
            id,
            file,
            mapping,
            log_handle,
            hooks,
            state: Mutex::new(StreamState {
                open_count: 1,
                sizes,
                section_size,
                lifecycle: Lifecycle::Active,
                pin_access,
                truncate_pending: None,
                write_queued: false,
            }),
            buffers: Mutex::new(BufferTable::new()),
            buffer_cv: Condvar::new(),
            visibility: RwLock::new(()),
            dirty_pages: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn file(&self) -> FileKey {
        self.file
    }

    pub(crate) fn mapping(&self) -> MappingId {
        self.mapping
    }

    pub(crate) fn log_handle(&self) -> Option<u64> {
        self.log_handle
    }

    pub(crate) fn hooks(&self) -> &dyn WriteBackHooks {
        self.hooks.as_ref()
    }

    /// Pages of this stream currently dirty (buffers plus mask).
    pub fn dirty_pages(&self) -> u64 {
        self.dirty_pages.load(Ordering::Acquire)
    }

    pub(crate) fn add_dirty(&self, pages: u64) -> u64 {
        self.dirty_pages.fetch_add(pages, Ordering::AcqRel) + pages
    }

    pub(crate) fn sub_dirty(&self, pages: u64) -> u64 {
        let prev = self.dirty_pages.fetch_sub(pages, Ordering::AcqRel);
        debug_assert!(prev >= pages, "stream dirty-page counter underflow");
        prev - pages
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn sizes(&self) -> StreamSizes {
        self.state.lock().sizes
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("file", &self.file)
            .field("dirty_pages", &self.dirty_pages())
            .finish_non_exhaustive()
    }
}
