//! # Cache Engine
//!
//! The public facade: wires the view pool, per-stream indices, buffer
//! tables, dirty accounting and the stream registry into the external
//! operation set, and owns the locking discipline between them.
//!
//! ## Lock Order
//!
//! Four lock domains, acquired in a fixed order (outer to inner):
//!
//! 1. per-stream **visibility** rwlock: pin/map/dirty-note paths shared,
//!    purge/truncate/teardown exclusive
//! 2. per-stream **buffer** mutex (+ condvar for pin admission)
//! 3. **pool** mutex: views and stream indices; never held across a mapper
//!    call (the pool drops it internally)
//! 4. **registry** mutex: taken only when no buffer or pool lock is held;
//!    the registry in turn may take a stream's state mutex
//!
//! Blocking happens only under the coarse per-stream locks or none at all:
//! mapper calls, pin-admission waits, write-admission waits and teardown
//! drains. Debug assertions in the lower layers back the contract up.
//!
//! ## Failure Discipline
//!
//! Every multi-step operation keeps an acquired-so-far record (created
//! buffers, acquired views, taken pins) and unwinds it on any early return,
//! so a failed call never leaks a view reference, a pin or an index node.

use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::accounting::DirtyAccountant;
use crate::buffer::{
    BufferId, BufferTable, FileKey, HandleKind, MappedSpan, OverlayBuffer, PinHandle, PinMode,
    UnpinAction,
};
use crate::config::{
    DEFAULT_POOL_CAPACITY, MAX_STREAM_SIZE, PAGE_SHIFT, PAGE_SIZE, WINDOW_SIZE,
};
use crate::error::CacheError;
use crate::mapper::{HeapMapper, ViewMapper};
use crate::stream::registry::{CreateOutcome, StreamRegistry};
use crate::stream::{Lifecycle, NoopHooks, Stream, StreamSizes, WriteBackHooks};
use crate::view::{ViewId, ViewPool};

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Views in the global pool; bounds total mapped address space.
    pub pool_capacity: usize,
    /// Dirty-page throttle threshold; auto-detected from RAM when `None`.
    pub dirty_threshold_pages: Option<usize>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            pool_capacity: DEFAULT_POOL_CAPACITY,
            dirty_threshold_pages: None,
        }
    }
}

/// Per-call pin/map behavior.
#[derive(Debug, Clone, Copy)]
pub struct PinFlags {
    /// Block for views, buffer admission and write admission. When false,
    /// any would-block condition unwinds the call and returns `None`.
    pub wait: bool,
    /// The caller scans forward; windows behind the access are released
    /// eagerly.
    pub sequential: bool,
}

impl Default for PinFlags {
    fn default() -> Self {
        Self {
            wait: true,
            sequential: false,
        }
    }
}

impl PinFlags {
    pub fn blocking() -> Self {
        Self::default()
    }

    pub fn nonblocking() -> Self {
        Self {
            wait: false,
            ..Self::default()
        }
    }

    pub fn with_sequential(mut self) -> Self {
        self.sequential = true;
        self
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Buffers written and cleaned.
    pub buffers: usize,
    /// Pages discharged (buffers plus mask bits).
    pub pages: u64,
}

/// One dirty range reported to a [`CacheEngine::query_dirty_ranges`] visitor.
#[derive(Debug, Clone, Copy)]
pub struct DirtyRange {
    pub file: FileKey,
    pub offset: u64,
    pub len: u64,
    pub oldest_seq: Option<u64>,
    pub newest_seq: Option<u64>,
}

/// The three dirty-page totals that must always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyTotals {
    pub global: u64,
    pub streams: u64,
    pub buffers: u64,
}

impl DirtyTotals {
    pub fn balanced(&self) -> bool {
        self.global == self.streams && self.streams == self.buffers
    }
}

/// Copy-plan chunk: one contiguous piece of a pinned or mapped range.
struct CopyChunk {
    view: ViewId,
    window_at: usize,
    caller_at: usize,
    len: usize,
}

/// The page-cache engine.
pub struct CacheEngine {
    mapper: Arc<dyn ViewMapper>,
    pool: ViewPool,
    registry: StreamRegistry,
    accountant: DirtyAccountant,
}

impl CacheEngine {
    pub fn new(mapper: Arc<dyn ViewMapper>, options: CacheOptions) -> Self {
        let accountant = match options.dirty_threshold_pages {
            Some(pages) => DirtyAccountant::with_threshold(pages),
            None => DirtyAccountant::auto_detect(),
        };
        Self {
            pool: ViewPool::new(Arc::clone(&mapper), options.pool_capacity),
            mapper,
            registry: StreamRegistry::new(),
            accountant,
        }
    }

    /// Engine over anonymous memory; the usual choice for tests and
    /// embedders without real backing files.
    pub fn in_memory(options: CacheOptions) -> Self {
        Self::new(Arc::new(HeapMapper::new()), options)
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Snapshot of the view-pool state partition.
    pub fn pool_partition(&self) -> crate::view::PoolPartition {
        self.pool.partition()
    }

    pub fn dirty_threshold_pages(&self) -> usize {
        self.accountant.threshold_pages()
    }

    /// Offsets of a stream's pinned buffers in their maintained
    /// (descending) order; introspection for tests and debugging.
    pub fn cached_buffer_offsets(&self, file: FileKey) -> Vec<u64> {
        self.registry
            .get(file)
            .map(|s| s.buffers.lock().offsets_descending())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------

    /// Enables caching of `file`. Concurrent calls for one file race to
    /// create; exactly one stream results and every caller holds one open
    /// count on it.
    pub fn initialize_stream(
        &self,
        file: FileKey,
        sizes: StreamSizes,
        pin_access: bool,
        hooks: Option<Arc<dyn WriteBackHooks>>,
        log_handle: Option<u64>,
    ) -> Result<()> {
        let largest = sizes.allocation_size.max(sizes.file_size);
        if largest > MAX_STREAM_SIZE {
            bail!(CacheError::SizeTooLarge {
                requested: largest,
                limit: MAX_STREAM_SIZE,
            });
        }

        match self.registry.begin_create(file) {
            CreateOutcome::Adopted(_) => Ok(()),
            CreateOutcome::Won(id) => {
                let section = section_for(&sizes);
                let mapping = match self.mapper.create_mapping(section) {
                    Ok(mapping) => mapping,
                    Err(err) => {
                        self.registry.abort_create(file);
                        return Err(err.wrap_err(CacheError::MappingFailed {
                            operation: "create_mapping",
                        }));
                    }
                };
                // The engine drives all write-back explicitly.
                self.mapper.disable_writeback_tracking(mapping);

                if let Err(err) = self.pool.attach_stream(id, mapping, section) {
                    self.mapper.delete_mapping(mapping);
                    self.registry.abort_create(file);
                    return Err(err);
                }

                let stream = Arc::new(Stream::new(
                    id,
                    file,
                    mapping,
                    sizes,
                    section,
                    pin_access,
                    hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
                    log_handle,
                ));
                self.registry.finish_create(stream);
                debug!(file, section, pin_access, "stream cached");
                Ok(())
            }
        }
    }

    /// Drops one open count. At zero with no dirty data the stream is torn
    /// down synchronously and `true` is returned; with dirty data it parks
    /// in lazy-delete for the write-behind path and `false` is returned
    /// without blocking. A `truncate_size` is remembered and applied before
    /// deferred write-back.
    pub fn uninitialize_stream(
        &self,
        file: FileKey,
        truncate_size: Option<u64>,
    ) -> Result<bool> {
        let stream = match self.registry.get(file) {
            Some(stream) => stream,
            None => return Ok(true),
        };

        enum Decision {
            StillOpen,
            Lazy,
            Now,
        }

        let decision = {
            let mut state = stream.state.lock();
            ensure!(state.open_count > 0, "uninitialize without a matching open");
            state.open_count -= 1;
            if let Some(truncate) = truncate_size {
                state.truncate_pending =
                    Some(state.truncate_pending.map_or(truncate, |t| t.min(truncate)));
            }
            if state.open_count > 0 {
                Decision::StillOpen
            } else if stream.dirty_pages() > 0 || state.write_queued {
                state.lifecycle = Lifecycle::LazyDelete;
                state.write_queued = true;
                Decision::Lazy
            } else {
                state.lifecycle = Lifecycle::Deleting;
                Decision::Now
            }
        };

        match decision {
            Decision::StillOpen => Ok(false),
            Decision::Lazy => {
                self.registry.mark_dirty_listed(&stream);
                debug!(file, "last close deferred to write-behind (dirty data)");
                Ok(false)
            }
            Decision::Now => {
                self.teardown_now(&stream)?;
                Ok(true)
            }
        }
    }

    /// Blocks until `file`'s stream is gone, bounded by `timeout`. Returns
    /// false on timeout; the in-flight teardown is unaffected either way.
    pub fn wait_for_teardown(&self, file: FileKey, timeout: Option<Duration>) -> bool {
        self.registry.wait_for_teardown(file, timeout)
    }

    /// Updates the stream's sizes: growth extends the mapping and deepens
    /// the index; a shrinking file size purges the cached tail.
    pub fn set_stream_sizes(&self, file: FileKey, sizes: StreamSizes) -> Result<()> {
        let stream = self.stream_for(file)?;
        let largest = sizes.allocation_size.max(sizes.file_size);
        if largest > MAX_STREAM_SIZE {
            bail!(CacheError::SizeTooLarge {
                requested: largest,
                limit: MAX_STREAM_SIZE,
            });
        }

        let needed = section_for(&sizes);
        let (old_file_size, current_section) = {
            let state = stream.state.lock();
            (state.sizes.file_size, state.section_size)
        };

        if needed > current_section {
            if let Err(err) = self.mapper.extend_mapping(stream.mapping(), needed) {
                return Err(err.wrap_err(CacheError::MappingFailed {
                    operation: "extend_mapping",
                }));
            }
            self.pool.extend_stream(stream.id(), needed)?;
        }

        if sizes.file_size < old_file_size {
            self.truncate_cached(&stream, sizes.file_size)?;
        }

        let mut state = stream.state.lock();
        state.sizes = sizes;
        state.section_size = state.section_size.max(needed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Map and pin
    // ------------------------------------------------------------------

    /// Maps a range for read without pinning buffers: the handle holds view
    /// references only. Unpin with any action releases them.
    pub fn map_for_read(
        &self,
        file: FileKey,
        offset: u64,
        len: u64,
        flags: PinFlags,
    ) -> Result<Option<PinHandle>> {
        let stream = self.stream_for(file)?;
        self.validate_range(&stream, offset, len)?;
        let _vis = stream.visibility.read();

        let mut spans: SmallVec<[MappedSpan; 2]> = SmallVec::new();
        let first = offset & !(WINDOW_SIZE - 1);
        let last = (offset + len - 1) & !(WINDOW_SIZE - 1);
        let mut window_offset = first;
        loop {
            if !flags.wait && !self.pool.contains(stream.id(), window_offset) {
                // Data not resident and the caller will not wait for a map.
                for span in &spans {
                    self.pool.release(span.view);
                }
                return Ok(None);
            }
            match self.pool.acquire(stream.id(), window_offset) {
                Ok(acquired) => spans.push(MappedSpan {
                    view: acquired.view,
                    window_offset: acquired.window_offset,
                }),
                Err(err) => {
                    for span in &spans {
                        self.pool.release(span.view);
                    }
                    return Err(err);
                }
            }
            if window_offset == last {
                break;
            }
            window_offset += WINDOW_SIZE;
        }

        if flags.sequential {
            self.pool.release_behind(stream.id(), offset);
        }

        Ok(Some(PinHandle {
            file,
            stream: stream.id(),
            offset,
            len,
            mode: PinMode::Read,
            kind: HandleKind::Mapped {
                spans,
                read_only: true,
            },
        }))
    }

    /// Pins a range for read: shared buffer admission, no dirtying.
    pub fn pin_for_read(
        &self,
        file: FileKey,
        offset: u64,
        len: u64,
        flags: PinFlags,
    ) -> Result<Option<PinHandle>> {
        self.pin_internal(file, offset, len, PinMode::Read, flags, false)
    }

    /// Pins a range for write: exclusive admission, range marked dirty,
    /// optional zeroing of the pinned bytes.
    pub fn prepare_for_write(
        &self,
        file: FileKey,
        offset: u64,
        len: u64,
        flags: PinFlags,
        zero: bool,
    ) -> Result<Option<PinHandle>> {
        self.pin_internal(file, offset, len, PinMode::Write, flags, zero)
    }

    fn pin_internal(
        &self,
        file: FileKey,
        offset: u64,
        len: u64,
        mode: PinMode,
        flags: PinFlags,
        zero: bool,
    ) -> Result<Option<PinHandle>> {
        let stream = self.stream_for(file)?;
        self.validate_range(&stream, offset, len)?;

        // Write admission happens before any lock; a deferred blocking
        // caller sleeps in the accountant's queue.
        if mode == PinMode::Write && !self.accountant.can_write(offset, len, !flags.wait) {
            return Ok(None);
        }

        let _vis = stream.visibility.read();
        let mut table = stream.buffers.lock();

        // Decompose against existing buffers; fill gaps with new buffers,
        // each taking one view reference. The `created` record is the
        // unwind list for every failure below.
        let segments = table.coverage(offset, len);
        let mut members: SmallVec<[BufferId; 4]> = SmallVec::new();
        let mut created: SmallVec<[(BufferId, ViewId); 4]> = SmallVec::new();

        for segment in &segments {
            match segment.existing {
                Some(id) => members.push(id),
                None => {
                    let acquired = match self.pool.acquire(stream.id(), segment.offset) {
                        Ok(acquired) => acquired,
                        Err(err) => {
                            self.unwind_created(&mut table, &created);
                            return Err(err);
                        }
                    };
                    let id = table.create(
                        segment.offset,
                        segment.len,
                        acquired.view,
                        acquired.window_offset,
                    );
                    created.push((id, acquired.view));
                    members.push(id);
                }
            }
        }

        // References before admission, so nothing we hold can be destroyed
        // while we wait.
        for id in &members {
            table.get_mut(*id).expect("member exists").pin_count += 1;
        }

        // All-or-nothing admission: never sleep holding part of a pin.
        loop {
            if table.can_admit_all(&members, mode) {
                table.admit_all(&members, mode);
                break;
            }
            if !flags.wait {
                for id in &members {
                    table.get_mut(*id).expect("member exists").pin_count -= 1;
                }
                self.unwind_created(&mut table, &created);
                trace!(file, offset, len, "pin would block; unwound");
                return Ok(None);
            }
            stream.buffer_cv.wait(&mut table);
        }

        // A write pin dirties every member, charging once per buffer that
        // makes the clean-to-dirty transition.
        let mut charged = 0usize;
        if mode == PinMode::Write {
            for id in &members {
                charged += table.get_mut(*id).expect("member exists").mark_dirty(None);
            }
            self.accountant.charge(charged);
            stream.add_dirty(charged as u64);
        }

        // Plan zeroing while the geometry is at hand.
        let mut zero_plan: SmallVec<[CopyChunk; 4]> = SmallVec::new();
        if zero {
            let end = offset + len;
            for id in &members {
                let buffer = table.get(*id).expect("member exists");
                let from = offset.max(buffer.offset);
                let to = end.min(buffer.end());
                if from < to {
                    zero_plan.push(CopyChunk {
                        view: buffer.view,
                        window_at: (from - buffer.window_offset) as usize,
                        caller_at: 0,
                        len: (to - from) as usize,
                    });
                }
            }
        }
        drop(table);

        if charged > 0 {
            self.registry.mark_dirty_listed(&stream);
        }

        let handle = PinHandle {
            file,
            stream: stream.id(),
            offset,
            len,
            mode,
            kind: if members.len() == 1 {
                HandleKind::Buffer(members[0])
            } else {
                HandleKind::Overlay(OverlayBuffer { members })
            },
        };

        for chunk in &zero_plan {
            let zeroed = self
                .pool
                .window(chunk.view)
                .and_then(|(token, _)| self.mapper.zero_window(token, chunk.window_at, chunk.len));
            if let Err(err) = zeroed {
                self.unpin(handle, UnpinAction::Unpin)?;
                return Err(err.wrap_err(CacheError::MappingFailed {
                    operation: "zero_window",
                }));
            }
        }

        if flags.sequential {
            self.pool.release_behind(stream.id(), offset);
        }

        Ok(Some(handle))
    }

    /// Removes created-but-unpinned buffers and releases their views.
    /// Called with the buffer lock held; pool-after-buffer is the
    /// documented order.
    fn unwind_created(&self, table: &mut BufferTable, created: &[(BufferId, ViewId)]) {
        for (id, view) in created.iter().rev() {
            table.remove(*id);
            self.pool.release(*view);
        }
    }

    /// Releases a pin. `Unpin` drops admission and one reference;
    /// `Unreference` drops the reference only (the natural action for map
    /// handles; on buffer handles it behaves like `Unpin`); `MarkClean`
    /// additionally cleans the buffers, discharging the accountants.
    pub fn unpin(&self, handle: PinHandle, action: UnpinAction) -> Result<()> {
        let stream = self.stream_for(handle.file)?;

        if let HandleKind::Mapped { spans, .. } = &handle.kind {
            for span in spans {
                self.pool.release(span.view);
            }
            return Ok(());
        }

        let members = handle.member_ids();
        let mut released: SmallVec<[ViewId; 4]> = SmallVec::new();
        let mut discharged = 0u64;
        {
            let mut table = stream.buffers.lock();
            table.release_admission_all(&members, handle.mode);
            if action == UnpinAction::MarkClean {
                for id in &members {
                    if let Some(buffer) = table.get_mut(*id) {
                        discharged += buffer.clean() as u64;
                    }
                }
            }
            for id in &members {
                let destroy = {
                    let buffer = match table.get_mut(*id) {
                        Some(buffer) => buffer,
                        None => bail!(CacheError::InconsistentState {
                            detail: "unpin of a vanished buffer",
                        }),
                    };
                    debug_assert!(buffer.pin_count > 0, "unpin without a reference");
                    buffer.pin_count -= 1;
                    buffer.is_destroyable()
                };
                if destroy {
                    if let Some(buffer) = table.remove(*id) {
                        released.push(buffer.view);
                    }
                }
            }
        }
        stream.buffer_cv.notify_all();

        for view in released {
            self.pool.release(view);
        }
        if discharged > 0 {
            self.accountant.discharge(discharged as usize);
            if stream.sub_dirty(discharged) == 0 {
                self.registry.mark_clean_listed(&stream);
            }
        }
        Ok(())
    }

    /// Marks an already-pinned range dirty, recording a write sequence.
    /// Buffer-backed handles only.
    pub fn mark_pin_dirty(&self, handle: &PinHandle, seq: Option<u64>) -> Result<()> {
        ensure!(
            !handle.is_mapped_only(),
            "map-only handles carry no buffer to dirty"
        );
        let stream = self.stream_for(handle.file)?;
        let members = handle.member_ids();

        let mut charged = 0usize;
        {
            let mut table = stream.buffers.lock();
            for id in &members {
                if let Some(buffer) = table.get_mut(*id) {
                    charged += buffer.mark_dirty(seq);
                }
            }
        }
        self.accountant.charge(charged);
        stream.add_dirty(charged as u64);
        if charged > 0 {
            self.registry.mark_dirty_listed(&stream);
        }
        Ok(())
    }

    /// Records an unpinned write through the stream's mask buffer: many
    /// small scattered writes cost one bitmap bit per page instead of a
    /// buffer each. Rejected on pin-access streams.
    pub fn note_unpinned_write(
        &self,
        file: FileKey,
        offset: u64,
        len: u64,
        seq: Option<u64>,
    ) -> Result<()> {
        let stream = self.stream_for(file)?;
        self.validate_range(&stream, offset, len)?;
        ensure!(
            !stream.state.lock().pin_access,
            "unpinned write on a pin-access stream"
        );

        let _vis = stream.visibility.read();
        let newly = {
            let mut table = stream.buffers.lock();
            let first = offset >> PAGE_SHIFT;
            let last = (offset + len - 1) >> PAGE_SHIFT;
            table.mask_mut().set_range(first, last, seq)
        };
        self.accountant.charge(newly as usize);
        stream.add_dirty(newly);
        if newly > 0 {
            self.registry.mark_dirty_listed(&stream);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Data plane
    // ------------------------------------------------------------------

    /// Copies from the pinned/mapped range into `buf`, starting at the
    /// handle's offset.
    pub fn read_pinned(&self, handle: &PinHandle, buf: &mut [u8]) -> Result<()> {
        ensure!(
            buf.len() as u64 <= handle.len,
            "read of {} bytes exceeds the {}-byte pinned range",
            buf.len(),
            handle.len
        );
        let plan = self.copy_plan(handle, buf.len() as u64)?;
        for chunk in &plan {
            let (token, _) = self.pool.window(chunk.view)?;
            self.mapper.read_window(
                token,
                chunk.window_at,
                &mut buf[chunk.caller_at..chunk.caller_at + chunk.len],
            )?;
        }
        Ok(())
    }

    /// Copies `data` into the pinned range, starting at the handle's
    /// offset. The handle must be writable.
    pub fn write_pinned(&self, handle: &PinHandle, data: &[u8]) -> Result<()> {
        ensure!(handle.is_writable(), "write through a read-only handle");
        ensure!(
            data.len() as u64 <= handle.len,
            "write of {} bytes exceeds the {}-byte pinned range",
            data.len(),
            handle.len
        );
        let plan = self.copy_plan(handle, data.len() as u64)?;
        for chunk in &plan {
            let (token, _) = self.pool.window(chunk.view)?;
            self.mapper.write_window(
                token,
                chunk.window_at,
                &data[chunk.caller_at..chunk.caller_at + chunk.len],
            )?;
        }
        Ok(())
    }

    /// Splits the first `len` bytes of a handle's range into per-view
    /// chunks. Members and spans are held by the handle, so the geometry
    /// cannot change underneath us.
    fn copy_plan(&self, handle: &PinHandle, len: u64) -> Result<SmallVec<[CopyChunk; 4]>> {
        let start = handle.offset;
        let end = start + len;
        let mut plan: SmallVec<[CopyChunk; 4]> = SmallVec::new();

        match &handle.kind {
            HandleKind::Mapped { spans, .. } => {
                for span in spans {
                    let window_end = span.window_offset + WINDOW_SIZE;
                    let from = start.max(span.window_offset);
                    let to = end.min(window_end);
                    if from < to {
                        plan.push(CopyChunk {
                            view: span.view,
                            window_at: (from - span.window_offset) as usize,
                            caller_at: (from - start) as usize,
                            len: (to - from) as usize,
                        });
                    }
                }
            }
            _ => {
                let stream = self.stream_for(handle.file)?;
                let table = stream.buffers.lock();
                for id in handle.member_ids() {
                    let buffer = match table.get(id) {
                        Some(buffer) => buffer,
                        None => bail!(CacheError::InconsistentState {
                            detail: "pinned buffer vanished while referenced",
                        }),
                    };
                    let from = start.max(buffer.offset);
                    let to = end.min(buffer.end());
                    if from < to {
                        plan.push(CopyChunk {
                            view: buffer.view,
                            window_at: (from - buffer.window_offset) as usize,
                            caller_at: (from - start) as usize,
                            len: (to - from) as usize,
                        });
                    }
                }
            }
        }
        Ok(plan)
    }

    // ------------------------------------------------------------------
    // Write admission
    // ------------------------------------------------------------------

    /// Write-throttle check for a prospective write of `len` bytes. A
    /// blocking call queues behind earlier deferrals and returns true once
    /// admitted; a non-blocking call returns false instead of queueing.
    pub fn can_write(&self, _file: FileKey, len: u64, nonblocking: bool) -> bool {
        self.accountant.can_write(0, len, nonblocking)
    }

    // ------------------------------------------------------------------
    // Purge, flush, write-behind
    // ------------------------------------------------------------------

    /// Discards cached data in the range without writing it: unpinned
    /// buffers (dirty or not) are destroyed, mask bits cleared, idle views
    /// unmapped. Returns true when nothing in the range survived; pinned
    /// buffers and their views always survive (with `force_detach` their
    /// survival is not reported as failure).
    pub fn purge_range(
        &self,
        file: FileKey,
        offset: Option<u64>,
        len: u64,
        force_detach: bool,
    ) -> Result<bool> {
        let stream = match self.registry.get(file) {
            Some(stream) => stream,
            None => return Ok(true),
        };
        let (start, end) = match offset {
            Some(offset) => (offset, offset.saturating_add(len)),
            None => (0, u64::MAX),
        };

        let _vis = stream.visibility.write();
        let mut pinned_remain = false;
        let mut released: SmallVec<[ViewId; 4]> = SmallVec::new();
        let mut discharged = 0u64;
        {
            let mut table = stream.buffers.lock();
            for id in table.intersecting_descending(start, end.saturating_sub(start)) {
                let destroy = {
                    let buffer = table.get_mut(id).expect("listed buffer exists");
                    if buffer.pin_count > 0 {
                        pinned_remain = true;
                        false
                    } else {
                        discharged += buffer.clean() as u64;
                        true
                    }
                };
                if destroy {
                    if let Some(buffer) = table.remove(id) {
                        released.push(buffer.view);
                    }
                }
            }

            // Pages fully inside the range lose their mask bits.
            if end > start {
                let first_page = start.div_ceil(PAGE_SIZE as u64);
                let last_page = if end == u64::MAX {
                    u64::MAX >> PAGE_SHIFT
                } else {
                    (end >> PAGE_SHIFT).saturating_sub(1)
                };
                if first_page <= last_page
                    && table.mask().map(|m| !m.is_empty()).unwrap_or(false)
                {
                    discharged += table.mask_mut().clear_range(first_page, last_page);
                }
            }
        }
        stream.buffer_cv.notify_all();

        for view in released {
            self.pool.release(view);
        }
        if discharged > 0 {
            self.accountant.discharge(discharged as usize);
            if stream.sub_dirty(discharged) == 0 {
                self.registry.mark_clean_listed(&stream);
            }
        }

        let detached = self.pool.detach_range(stream.id(), start & !(WINDOW_SIZE - 1));
        let purged = self
            .mapper
            .purge_mapping(stream.mapping(), start, end.saturating_sub(start));

        debug!(file, start, pinned_remain, detached, "purged cached range");
        Ok(force_detach || (!pinned_remain && detached && purged))
    }

    /// Writes dirty data in the range to the backing store and cleans it,
    /// visiting buffers in descending-offset order. Invokes the stream's
    /// lazy-write hooks around the pass and `flush_to_sequence` before any
    /// sequenced data is written. Pinned-dirty buffers are skipped.
    pub fn flush_range(
        &self,
        file: FileKey,
        offset: Option<u64>,
        len: u64,
    ) -> Result<FlushStats> {
        let stream = self.stream_for(file)?;
        let (start, end) = match offset {
            Some(offset) => (offset, offset.saturating_add(len)),
            None => (0, u64::MAX),
        };

        if !stream.hooks().acquire_for_lazy_write(file) {
            trace!(file, "lazy-write hook declined; flush skipped");
            return Ok(FlushStats::default());
        }
        let result = self.flush_stream_range(&stream, start, end);
        stream.hooks().release_from_lazy_write(file);

        let stats = result?;
        if stats.pages > 0 {
            self.accountant.discharge(stats.pages as usize);
            if stream.sub_dirty(stats.pages) == 0 {
                self.registry.mark_clean_listed(&stream);
            }
        }
        Ok(stats)
    }

    fn flush_stream_range(
        &self,
        stream: &Arc<Stream>,
        start: u64,
        end: u64,
    ) -> Result<FlushStats> {
        let mut flush_ranges: Vec<(u64, u64)> = Vec::new();
        let mut released: SmallVec<[ViewId; 4]> = SmallVec::new();
        let mut stats = FlushStats::default();
        {
            let mut table = stream.buffers.lock();
            let ids = table.intersecting_descending(start, end.saturating_sub(start));

            // The caller's log must reach the newest sequence we are about
            // to write before the data goes out.
            let mut newest: Option<u64> = None;
            for id in &ids {
                if let Some(buffer) = table.get(*id) {
                    if buffer.is_dirty() && buffer.pin_count() == 0 {
                        newest = newest.max(buffer.newest_seq());
                    }
                }
            }
            if let Some(mask) = table.mask() {
                if !mask.is_empty() {
                    newest = newest.max(mask.newest_seq());
                }
            }
            if let Some(seq) = newest {
                stream.hooks().flush_to_sequence(seq);
            }

            for id in ids {
                let cleaned = {
                    let buffer = table.get_mut(id).expect("listed buffer exists");
                    if !buffer.is_dirty() || buffer.pin_count() > 0 {
                        continue;
                    }
                    flush_ranges.push((buffer.offset, buffer.len));
                    buffer.clean() as u64
                };
                stats.pages += cleaned;
                stats.buffers += 1;
                let destroy = table
                    .get(id)
                    .map(|b| b.is_destroyable())
                    .unwrap_or(false);
                if destroy {
                    if let Some(buffer) = table.remove(id) {
                        released.push(buffer.view);
                    }
                }
            }

            if end > start && table.mask().map(|m| !m.is_empty()).unwrap_or(false) {
                let first = start >> PAGE_SHIFT;
                let last = (end - 1) >> PAGE_SHIFT;
                let cleared = table.mask_mut().clear_range(first, last);
                if cleared > 0 {
                    stats.pages += cleared;
                    let sizes = stream.sizes();
                    let to = sizes.file_size.min(end);
                    flush_ranges.push((start.min(to), to.saturating_sub(start.min(to))));
                }
            }
        }
        stream.buffer_cv.notify_all();

        for view in released {
            self.pool.release(view);
        }
        for (offset, len) in flush_ranges {
            if len == 0 {
                continue;
            }
            if let Err(err) = self.mapper.flush_mapping(stream.mapping(), offset, len) {
                return Err(err.wrap_err(CacheError::MappingFailed {
                    operation: "flush_mapping",
                }));
            }
        }
        Ok(stats)
    }

    /// Next stream on the dirty list, from the registry's standing cursor.
    /// This is the entry point the external write-behind scheduler drives.
    pub fn next_dirty_stream(&self) -> Option<FileKey> {
        self.registry.next_dirty_stream().map(|s| s.file())
    }

    /// One write-behind pass over a stream: applies a pending deferred
    /// truncation, flushes everything else, and completes a lazy deletion
    /// once the stream is clean. Returns true when the stream ended the
    /// pass clean (or gone).
    pub fn write_behind_pass(&self, file: FileKey) -> Result<bool> {
        let stream = match self.registry.get(file) {
            Some(stream) => stream,
            None => return Ok(true),
        };

        let truncate = {
            let mut state = stream.state.lock();
            state.write_queued = false;
            if state.lifecycle == Lifecycle::LazyDelete {
                state.truncate_pending.take()
            } else {
                None
            }
        };
        if let Some(truncate_size) = truncate {
            // Data beyond the deferred truncation point is discarded, not
            // written.
            self.truncate_cached(&stream, truncate_size)?;
            let mut state = stream.state.lock();
            let sizes = &mut state.sizes;
            sizes.file_size = sizes.file_size.min(truncate_size);
            sizes.valid_data_length = sizes.valid_data_length.min(truncate_size);
        }

        self.flush_range(file, None, u64::MAX)?;

        if stream.dirty_pages() == 0 {
            let finish = {
                let mut state = stream.state.lock();
                if state.lifecycle == Lifecycle::LazyDelete && state.open_count == 0 {
                    state.lifecycle = Lifecycle::Deleting;
                    true
                } else {
                    false
                }
            };
            if finish {
                self.teardown_now(&stream)?;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reports every dirty range owned by streams registered against
    /// `log_handle`, buffers in descending-offset order then mask runs.
    /// Returns the oldest write sequence still dirty, the caller's log
    /// cannot be trimmed past it.
    pub fn query_dirty_ranges(
        &self,
        log_handle: u64,
        mut visitor: impl FnMut(&DirtyRange),
    ) -> Option<u64> {
        let mut oldest: Option<u64> = None;
        for stream in self.registry.streams() {
            if stream.log_handle() != Some(log_handle) {
                continue;
            }
            let table = stream.buffers.lock();
            for id in table.ids_descending() {
                if let Some(buffer) = table.get(id) {
                    if buffer.is_dirty() {
                        visitor(&DirtyRange {
                            file: stream.file(),
                            offset: buffer.offset(),
                            len: buffer.len(),
                            oldest_seq: buffer.oldest_seq(),
                            newest_seq: buffer.newest_seq(),
                        });
                    }
                }
            }
            if let Some(mask) = table.mask() {
                for (first, last) in mask.dirty_runs() {
                    visitor(&DirtyRange {
                        file: stream.file(),
                        offset: first << PAGE_SHIFT,
                        len: (last - first + 1) << PAGE_SHIFT,
                        oldest_seq: mask.oldest_seq(),
                        newest_seq: mask.newest_seq(),
                    });
                }
            }
            oldest = match (oldest, table.oldest_seq()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        oldest
    }

    /// The three dirty-page totals. `balanced()` must hold after every
    /// mutating operation; tests lean on it heavily.
    pub fn dirty_totals(&self) -> DirtyTotals {
        let mut streams = 0u64;
        let mut buffers = 0u64;
        for stream in self.registry.streams() {
            streams += stream.dirty_pages();
            buffers += stream.buffers.lock().dirty_contribution();
        }
        let totals = DirtyTotals {
            global: self.accountant.global_dirty() as u64,
            streams,
            buffers,
        };
        debug_assert!(totals.balanced(), "dirty accounting diverged: {:?}", totals);
        totals
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn stream_for(&self, file: FileKey) -> Result<Arc<Stream>> {
        self.registry
            .get(file)
            .ok_or_else(|| eyre::eyre!("file {} is not cached", file))
    }

    fn validate_range(&self, stream: &Arc<Stream>, offset: u64, len: u64) -> Result<()> {
        ensure!(len > 0, "zero-length cache access");
        let sizes = stream.sizes();
        let end = match offset.checked_add(len) {
            Some(end) => end,
            None => bail!(CacheError::SizeTooLarge {
                requested: u64::MAX,
                limit: sizes.file_size,
            }),
        };
        if end > sizes.file_size {
            bail!(CacheError::SizeTooLarge {
                requested: end,
                limit: sizes.file_size,
            });
        }
        Ok(())
    }

    /// Destroys cached state at and beyond `new_size` (page-rounded up):
    /// buffers, mask bits and idle views. Pinned buffers in the doomed
    /// region are a caller error.
    fn truncate_cached(&self, stream: &Arc<Stream>, new_size: u64) -> Result<()> {
        let _vis = stream.visibility.write();
        let page = PAGE_SIZE as u64;
        let keep_bytes = new_size.div_ceil(page) * page;

        let mut released: SmallVec<[ViewId; 4]> = SmallVec::new();
        let mut discharged = 0u64;
        {
            let mut table = stream.buffers.lock();
            for id in table.intersecting_descending(keep_bytes, u64::MAX - keep_bytes) {
                let buffer = table.get_mut(id).expect("listed buffer exists");
                if buffer.pin_count() > 0 {
                    bail!(CacheError::InconsistentState {
                        detail: "truncation of a pinned range",
                    });
                }
                discharged += buffer.clean() as u64;
                if let Some(buffer) = table.remove(id) {
                    released.push(buffer.view);
                }
            }
            if table.mask().map(|m| !m.is_empty()).unwrap_or(false) {
                let first_page = keep_bytes >> PAGE_SHIFT;
                discharged += table
                    .mask_mut()
                    .clear_range(first_page, u64::MAX >> PAGE_SHIFT);
            }
        }
        stream.buffer_cv.notify_all();

        for view in released {
            self.pool.release(view);
        }
        if discharged > 0 {
            self.accountant.discharge(discharged as usize);
            if stream.sub_dirty(discharged) == 0 {
                self.registry.mark_clean_listed(&stream);
            }
        }

        let from_window = keep_bytes.div_ceil(WINDOW_SIZE) * WINDOW_SIZE;
        if !self.pool.detach_range(stream.id(), from_window) {
            bail!(CacheError::InconsistentState {
                detail: "truncated range still has active views",
            });
        }
        self.mapper
            .purge_mapping(stream.mapping(), keep_bytes, u64::MAX - keep_bytes);
        debug!(file = stream.file(), new_size, "truncated cached tail");
        Ok(())
    }

    /// Synchronous teardown: destroys remaining (necessarily clean,
    /// unreferenced) buffers, drains active views, detaches the stream from
    /// the pool, deletes the mapping and unregisters. Signals every
    /// teardown waiter.
    fn teardown_now(&self, stream: &Arc<Stream>) -> Result<()> {
        {
            let _vis = stream.visibility.write();
            let mut released: Vec<ViewId> = Vec::new();
            {
                let mut table = stream.buffers.lock();
                for id in table.ids_descending() {
                    if let Some(buffer) = table.remove(id) {
                        debug_assert!(
                            buffer.is_destroyable(),
                            "teardown with a referenced or dirty buffer"
                        );
                        released.push(buffer.view);
                    }
                }
                debug_assert!(
                    table.mask().map(|m| m.is_empty()).unwrap_or(true),
                    "teardown with dirty mask bits"
                );
            }
            for view in released {
                self.pool.release(view);
            }
        }

        // Outstanding map handles at open count zero are a caller bug, but
        // an in-flight release is legitimate; wait it out.
        self.pool.wait_drained(stream.id(), None);
        self.pool.detach_stream(stream.id())?;
        self.mapper.delete_mapping(stream.mapping());

        stream.state.lock().lifecycle = Lifecycle::Gone;
        self.registry.remove(stream);
        debug!(file = stream.file(), "stream torn down");
        Ok(())
    }
}

fn section_for(sizes: &StreamSizes) -> u64 {
    let needed = sizes.allocation_size.max(sizes.file_size).max(1);
    needed.div_ceil(WINDOW_SIZE) * WINDOW_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CacheEngine {
        CacheEngine::in_memory(CacheOptions {
            pool_capacity: 8,
            dirty_threshold_pages: Some(1 << 20),
        })
    }

    fn init(engine: &CacheEngine, file: FileKey, len: u64) {
        engine
            .initialize_stream(file, StreamSizes::exact(len), false, None, None)
            .unwrap();
    }

    #[test]
    fn pin_write_read_round_trip() {
        let engine = engine();
        init(&engine, 1, 1 << 20);

        let pin = engine
            .prepare_for_write(1, 8192, 100, PinFlags::blocking(), false)
            .unwrap()
            .unwrap();
        engine.write_pinned(&pin, b"cached bytes").unwrap();
        engine.unpin(pin, UnpinAction::Unpin).unwrap();

        let pin = engine
            .pin_for_read(1, 8192, 100, PinFlags::blocking())
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 12];
        engine.read_pinned(&pin, &mut buf).unwrap();
        assert_eq!(&buf, b"cached bytes");
        engine.unpin(pin, UnpinAction::Unpin).unwrap();
    }

    #[test]
    fn map_for_read_holds_no_buffers() {
        let engine = engine();
        init(&engine, 1, 1 << 20);

        let map = engine
            .map_for_read(1, 0, 4096, PinFlags::blocking())
            .unwrap()
            .unwrap();
        assert!(map.is_mapped_only());
        assert!(!map.is_writable());
        assert_eq!(map.buffer_count(), 0);

        let mut buf = [0u8; 16];
        engine.read_pinned(&map, &mut buf).unwrap();
        engine.unpin(map, UnpinAction::Unreference).unwrap();

        let p = engine.pool_partition();
        assert_eq!(p.in_use, 0);
    }

    #[test]
    fn map_spanning_windows_reads_across_them() {
        let engine = engine();
        init(&engine, 1, WINDOW_SIZE * 2);

        let pin = engine
            .prepare_for_write(1, WINDOW_SIZE - 4, 8, PinFlags::blocking(), false)
            .unwrap()
            .unwrap();
        engine.write_pinned(&pin, b"ABCDEFGH").unwrap();
        engine.unpin(pin, UnpinAction::MarkClean).unwrap();

        let map = engine
            .map_for_read(1, WINDOW_SIZE - 4, 8, PinFlags::blocking())
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 8];
        engine.read_pinned(&map, &mut buf).unwrap();
        assert_eq!(&buf, b"ABCDEFGH");
        engine.unpin(map, UnpinAction::Unreference).unwrap();
    }

    #[test]
    fn write_pin_charges_accounting_once() {
        let engine = engine();
        init(&engine, 1, 1 << 20);

        let pin = engine
            .prepare_for_write(1, 0, 4096, PinFlags::blocking(), false)
            .unwrap()
            .unwrap();
        assert_eq!(engine.dirty_totals().global, 1);

        // Re-pinning the same dirty buffer charges nothing.
        engine.unpin(pin, UnpinAction::Unpin).unwrap();
        let pin = engine
            .prepare_for_write(1, 0, 4096, PinFlags::blocking(), false)
            .unwrap()
            .unwrap();
        assert_eq!(engine.dirty_totals().global, 1);
        engine.unpin(pin, UnpinAction::MarkClean).unwrap();
        assert_eq!(engine.dirty_totals().global, 0);
    }

    #[test]
    fn note_unpinned_write_rejected_on_pin_access_stream() {
        let engine = engine();
        engine
            .initialize_stream(7, StreamSizes::exact(1 << 20), true, None, None)
            .unwrap();
        assert!(engine.note_unpinned_write(7, 0, 4096, None).is_err());
        engine.uninitialize_stream(7, None).unwrap();
    }

    #[test]
    fn pin_beyond_eof_is_size_too_large() {
        let engine = engine();
        init(&engine, 1, 8192);
        let err = engine
            .pin_for_read(1, 4096, 8192, PinFlags::blocking())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::SizeTooLarge { .. })
        ));
    }

    #[test]
    fn grow_then_pin_new_region() {
        let engine = engine();
        init(&engine, 1, WINDOW_SIZE);

        engine
            .set_stream_sizes(1, StreamSizes::exact(WINDOW_SIZE * 3))
            .unwrap();
        let pin = engine
            .prepare_for_write(1, WINDOW_SIZE * 2, 4096, PinFlags::blocking(), true)
            .unwrap()
            .unwrap();
        let mut buf = [0xFFu8; 32];
        engine.read_pinned(&pin, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "zero option clears the range");
        engine.unpin(pin, UnpinAction::MarkClean).unwrap();
    }
}
