//! # Pinned-Buffer Table
//!
//! Per-stream tracking of resident, reference-counted byte ranges. A pinned
//! buffer is an exact page-rounded range confined to one view window; it
//! holds one reference on that view for as long as it exists, which is what
//! keeps pinned (and dirty-but-unreferenced) data immune to pool eviction.
//!
//! ## Shape Of A Pin
//!
//! A pin request is decomposed against the existing buffers:
//!
//! - a sub-range already covered by a buffer reuses it (one more reference)
//! - an uncovered gap gets a new buffer, page-rounded and clamped to its
//!   window, so buffers never overlap and never cross windows
//! - if the request ends up touching more than one buffer, the caller gets
//!   an [`OverlayBuffer`] naming all of them; unpinning the overlay fans out
//!
//! Buffers are kept in an ordered map and visited in descending-offset order
//! by write-back, matching the order in which sequential writers release
//! them.
//!
//! ## Pin Admission
//!
//! Read pins share a buffer; a write pin is exclusive. Admission is
//! all-or-nothing across every member of a pin: the engine checks the whole
//! member set under the stream's buffer lock and either takes every
//! admission or none, waiting (or reporting would-block) otherwise, so no
//! caller ever sleeps holding part of a pin.
//!
//! ## Dirtiness
//!
//! A buffer's first dirtying charges its full page span to the accountants;
//! further dirtying of the same buffer charges nothing. Cleaning (write-back,
//! purge, mark-clean) discharges the same amount exactly once. A buffer dies
//! only when its pin count is zero *and* it is clean; a dirty unreferenced
//! buffer stays, with its view, until write-back cleans it. The companion
//! [`MaskBuffer`](mask::MaskBuffer) tracks unpinned scattered writes by
//! bitmap instead and feeds the same accounting.

pub mod mask;

use std::collections::BTreeMap;

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::accounting::pages_spanned;
use crate::config::{PAGE_SIZE, WINDOW_SIZE};
use crate::view::{StreamId, ViewId};

pub use mask::MaskBuffer;

/// Identifies one pinned buffer within its stream.
pub type BufferId = u64;

/// Caller-chosen key identifying a cached file.
pub type FileKey = u64;

/// How a range is being pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Read,
    Write,
}

/// What releasing a pin should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpinAction {
    /// Release the admission and one reference.
    Unpin,
    /// Release one reference only (map handles; no admission was taken).
    Unreference,
    /// Release like `Unpin` and also mark the buffers clean, discharging
    /// the accountants.
    MarkClean,
}

/// A resident, reference-counted, page-rounded range of one stream.
#[derive(Debug)]
pub struct PinnedBuffer {
    pub(crate) id: BufferId,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) view: ViewId,
    pub(crate) window_offset: u64,
    pub(crate) pin_count: u32,
    readers: u32,
    writer: bool,
    pub(crate) dirty: bool,
    pub(crate) oldest_seq: Option<u64>,
    pub(crate) newest_seq: Option<u64>,
}

impl PinnedBuffer {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn oldest_seq(&self) -> Option<u64> {
        self.oldest_seq
    }

    pub fn newest_seq(&self) -> Option<u64> {
        self.newest_seq
    }

    /// Whole pages this buffer spans; its dirty contribution when dirty.
    pub fn pages(&self) -> usize {
        pages_spanned(self.offset, self.len)
    }

    fn can_admit(&self, mode: PinMode) -> bool {
        match mode {
            PinMode::Read => !self.writer,
            PinMode::Write => !self.writer && self.readers == 0,
        }
    }

    fn admit(&mut self, mode: PinMode) {
        debug_assert!(self.can_admit(mode));
        match mode {
            PinMode::Read => self.readers += 1,
            PinMode::Write => self.writer = true,
        }
    }

    fn release_admission(&mut self, mode: PinMode) {
        match mode {
            PinMode::Read => {
                debug_assert!(self.readers > 0, "reader admission underflow");
                self.readers = self.readers.saturating_sub(1);
            }
            PinMode::Write => {
                debug_assert!(self.writer, "writer admission released twice");
                self.writer = false;
            }
        }
    }

    /// Marks the buffer dirty, returning the pages to charge (non-zero only
    /// on the clean-to-dirty transition).
    pub(crate) fn mark_dirty(&mut self, seq: Option<u64>) -> usize {
        if let Some(seq) = seq {
            self.oldest_seq = Some(self.oldest_seq.map_or(seq, |o| o.min(seq)));
            self.newest_seq = Some(self.newest_seq.map_or(seq, |n| n.max(seq)));
        }
        if self.dirty {
            return 0;
        }
        self.dirty = true;
        self.pages()
    }

    /// Marks the buffer clean, returning the pages to discharge.
    pub(crate) fn clean(&mut self) -> usize {
        if !self.dirty {
            return 0;
        }
        self.dirty = false;
        self.oldest_seq = None;
        self.newest_seq = None;
        self.pages()
    }

    /// Destroyable means unreferenced and clean.
    pub(crate) fn is_destroyable(&self) -> bool {
        self.pin_count == 0 && !self.dirty
    }
}

/// One logical pin spanning several underlying buffers. Members are listed
/// in walk order (ascending offset); every operation on the overlay fans out
/// to all of them.
#[derive(Debug, Clone)]
pub struct OverlayBuffer {
    pub(crate) members: SmallVec<[BufferId; 4]>,
}

impl OverlayBuffer {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// One window's worth of a map-only handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MappedSpan {
    pub view: ViewId,
    pub window_offset: u64,
}

#[derive(Debug, Clone)]
pub(crate) enum HandleKind {
    /// Map-only access: view references, no buffers, no admission. The
    /// read-only marker is an explicit field, not a bit stolen from a
    /// pointer.
    Mapped {
        spans: SmallVec<[MappedSpan; 2]>,
        read_only: bool,
    },
    /// A pin satisfied by exactly one buffer.
    Buffer(BufferId),
    /// A pin crossing buffer boundaries.
    Overlay(OverlayBuffer),
}

/// Handle returned by the map/pin entry points; passed back to `unpin`.
#[derive(Debug)]
pub struct PinHandle {
    pub(crate) file: FileKey,
    pub(crate) stream: StreamId,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) mode: PinMode,
    pub(crate) kind: HandleKind,
}

impl PinHandle {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_writable(&self) -> bool {
        match &self.kind {
            HandleKind::Mapped { read_only, .. } => !*read_only,
            _ => self.mode == PinMode::Write,
        }
    }

    /// True for a map-only handle (no buffers underneath).
    pub fn is_mapped_only(&self) -> bool {
        matches!(self.kind, HandleKind::Mapped { .. })
    }

    /// True when the pin spans more than one underlying buffer.
    pub fn is_overlay(&self) -> bool {
        matches!(self.kind, HandleKind::Overlay(_))
    }

    /// Underlying buffers backing this handle (zero for map-only).
    pub fn buffer_count(&self) -> usize {
        match &self.kind {
            HandleKind::Mapped { .. } => 0,
            HandleKind::Buffer(_) => 1,
            HandleKind::Overlay(o) => o.member_count(),
        }
    }

    pub(crate) fn member_ids(&self) -> SmallVec<[BufferId; 4]> {
        match &self.kind {
            HandleKind::Mapped { .. } => SmallVec::new(),
            HandleKind::Buffer(id) => smallvec::smallvec![*id],
            HandleKind::Overlay(o) => o.members.clone(),
        }
    }
}

/// One piece of a pin request after decomposition against existing buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    pub offset: u64,
    pub len: u64,
    /// Buffer already covering this piece, if any.
    pub existing: Option<BufferId>,
}

/// The per-stream set of pinned buffers plus the optional mask buffer.
/// Guarded by the stream's buffer mutex; nothing here locks.
#[derive(Debug, Default)]
pub struct BufferTable {
    buffers: BTreeMap<u64, PinnedBuffer>,
    by_id: HashMap<BufferId, u64>,
    mask: Option<MaskBuffer>,
    next_id: BufferId,
}

impl BufferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Decomposes the page-rounded hull of `[offset, offset + len)` into
    /// covered and uncovered segments. Gaps are split at window boundaries
    /// so each can become one buffer; covered segments carry the whole
    /// existing buffer.
    pub(crate) fn coverage(&self, offset: u64, len: u64) -> SmallVec<[Segment; 4]> {
        let page = PAGE_SIZE as u64;
        let start = offset & !(page - 1);
        let end = (offset + len).div_ceil(page) * page;

        let mut segments = SmallVec::new();
        let mut at = start;

        // Buffers never overlap, so walking them in ascending order tiles
        // the range once.
        for buffer in self.buffers.range(..end).map(|(_, b)| b) {
            if buffer.end() <= at {
                continue;
            }
            if buffer.offset >= end {
                break;
            }
            if buffer.offset > at {
                Self::push_gaps(&mut segments, at, buffer.offset);
            }
            segments.push(Segment {
                offset: buffer.offset,
                len: buffer.len,
                existing: Some(buffer.id),
            });
            at = buffer.end();
        }
        if at < end {
            Self::push_gaps(&mut segments, at, end);
        }
        segments
    }

    /// Splits `[from, to)` at window boundaries into gap segments.
    fn push_gaps(segments: &mut SmallVec<[Segment; 4]>, from: u64, to: u64) {
        let mut at = from;
        while at < to {
            let window_end = (at & !(WINDOW_SIZE - 1)) + WINDOW_SIZE;
            let next = to.min(window_end);
            segments.push(Segment {
                offset: at,
                len: next - at,
                existing: None,
            });
            at = next;
        }
    }

    /// Inserts a buffer for an uncovered gap. The range must be page-rounded
    /// and confined to the window at `window_offset`.
    pub(crate) fn create(
        &mut self,
        offset: u64,
        len: u64,
        view: ViewId,
        window_offset: u64,
    ) -> BufferId {
        debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
        debug_assert_eq!(len % PAGE_SIZE as u64, 0);
        debug_assert!(offset >= window_offset && offset + len <= window_offset + WINDOW_SIZE);

        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(
            offset,
            PinnedBuffer {
                id,
                offset,
                len,
                view,
                window_offset,
                pin_count: 0,
                readers: 0,
                writer: false,
                dirty: false,
                oldest_seq: None,
                newest_seq: None,
            },
        );
        self.by_id.insert(id, offset);
        id
    }

    pub(crate) fn get(&self, id: BufferId) -> Option<&PinnedBuffer> {
        self.by_id.get(&id).and_then(|off| self.buffers.get(off))
    }

    pub(crate) fn get_mut(&mut self, id: BufferId) -> Option<&mut PinnedBuffer> {
        let offset = *self.by_id.get(&id)?;
        self.buffers.get_mut(&offset)
    }

    /// Removes a buffer, returning it so the caller can release its view.
    pub(crate) fn remove(&mut self, id: BufferId) -> Option<PinnedBuffer> {
        let offset = self.by_id.remove(&id)?;
        self.buffers.remove(&offset)
    }

    /// True when every member can take `mode` admission right now.
    pub(crate) fn can_admit_all(&self, ids: &[BufferId], mode: PinMode) -> bool {
        ids.iter().all(|id| {
            self.get(*id)
                .map(|b| b.can_admit(mode))
                .unwrap_or(false)
        })
    }

    /// Takes `mode` admission on every member. Callers check
    /// [`can_admit_all`](Self::can_admit_all) first under the same lock
    /// hold, so this cannot fail partway.
    pub(crate) fn admit_all(&mut self, ids: &[BufferId], mode: PinMode) {
        for id in ids {
            self.get_mut(*id).expect("member vanished").admit(mode);
        }
    }

    pub(crate) fn release_admission_all(&mut self, ids: &[BufferId], mode: PinMode) {
        for id in ids {
            if let Some(buffer) = self.get_mut(*id) {
                buffer.release_admission(mode);
            }
        }
    }

    /// Buffer ids intersecting `[offset, offset + len)` in descending-offset
    /// order, the order write-back visits them.
    pub(crate) fn intersecting_descending(&self, offset: u64, len: u64) -> Vec<BufferId> {
        let end = offset.saturating_add(len);
        self.buffers
            .values()
            .rev()
            .filter(|b| b.offset < end && b.end() > offset)
            .map(|b| b.id)
            .collect()
    }

    /// All buffer ids in descending-offset order.
    pub(crate) fn ids_descending(&self) -> Vec<BufferId> {
        self.buffers.values().rev().map(|b| b.id).collect()
    }

    /// All buffer offsets in descending order; scenario tests assert on it.
    pub fn offsets_descending(&self) -> Vec<u64> {
        self.buffers.keys().rev().copied().collect()
    }

    /// Lazily creates the mask buffer.
    pub(crate) fn mask_mut(&mut self) -> &mut MaskBuffer {
        self.mask.get_or_insert_with(MaskBuffer::new)
    }

    pub(crate) fn mask(&self) -> Option<&MaskBuffer> {
        self.mask.as_ref()
    }

    /// Combined dirty-page contribution of buffers and mask: one stream's
    /// share of the accounting equality.
    pub fn dirty_contribution(&self) -> u64 {
        let buffers: u64 = self
            .buffers
            .values()
            .filter(|b| b.dirty)
            .map(|b| b.pages() as u64)
            .sum();
        let mask = self.mask.as_ref().map(|m| m.dirty_pages()).unwrap_or(0);
        buffers + mask
    }

    /// Oldest write-sequence mark across dirty buffers and the mask.
    pub(crate) fn oldest_seq(&self) -> Option<u64> {
        let buffers = self
            .buffers
            .values()
            .filter(|b| b.dirty)
            .filter_map(|b| b.oldest_seq)
            .min();
        let mask = self.mask.as_ref().and_then(|m| m.oldest_seq());
        match (buffers, mask) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn table_with(buffers: &[(u64, u64)]) -> BufferTable {
        let mut table = BufferTable::new();
        for &(offset, len) in buffers {
            let window = offset & !(WINDOW_SIZE - 1);
            table.create(offset, len, ViewId(0), window);
        }
        table
    }

    #[test]
    fn coverage_of_empty_table_is_one_gap() {
        let table = BufferTable::new();
        let segments = table.coverage(100, 1000);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].offset, 0);
        assert_eq!(segments[0].len, PAGE);
        assert!(segments[0].existing.is_none());
    }

    #[test]
    fn coverage_splits_gaps_at_window_boundaries() {
        let table = BufferTable::new();
        let segments = table.coverage(WINDOW_SIZE - PAGE, 3 * PAGE);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].offset, WINDOW_SIZE - PAGE);
        assert_eq!(segments[0].len, PAGE);
        assert_eq!(segments[1].offset, WINDOW_SIZE);
        assert_eq!(segments[1].len, 2 * PAGE);
    }

    #[test]
    fn coverage_reuses_existing_buffer_whole() {
        let table = table_with(&[(0, 4 * PAGE)]);
        let segments = table.coverage(PAGE, PAGE);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].len, 4 * PAGE);
        assert!(segments[0].existing.is_some());
    }

    #[test]
    fn coverage_mixes_buffers_and_gaps() {
        let table = table_with(&[(2 * PAGE, 2 * PAGE)]);
        let segments = table.coverage(0, 6 * PAGE);
        assert_eq!(segments.len(), 3);
        assert!(segments[0].existing.is_none());
        assert_eq!((segments[0].offset, segments[0].len), (0, 2 * PAGE));
        assert!(segments[1].existing.is_some());
        assert!(segments[2].existing.is_none());
        assert_eq!((segments[2].offset, segments[2].len), (4 * PAGE, 2 * PAGE));
    }

    #[test]
    fn write_admission_is_exclusive() {
        let mut table = table_with(&[(0, PAGE)]);
        let id = table.ids_descending()[0];

        assert!(table.can_admit_all(&[id], PinMode::Read));
        table.admit_all(&[id], PinMode::Read);

        assert!(table.can_admit_all(&[id], PinMode::Read));
        assert!(!table.can_admit_all(&[id], PinMode::Write));

        table.release_admission_all(&[id], PinMode::Read);
        assert!(table.can_admit_all(&[id], PinMode::Write));
        table.admit_all(&[id], PinMode::Write);
        assert!(!table.can_admit_all(&[id], PinMode::Read));
    }

    #[test]
    fn dirty_charges_once_per_buffer() {
        let mut table = table_with(&[(0, 3 * PAGE)]);
        let id = table.ids_descending()[0];

        let buffer = table.get_mut(id).unwrap();
        assert_eq!(buffer.mark_dirty(Some(7)), 3);
        assert_eq!(buffer.mark_dirty(Some(9)), 0);
        assert_eq!(buffer.oldest_seq(), Some(7));
        assert_eq!(buffer.newest_seq(), Some(9));
        assert_eq!(table.dirty_contribution(), 3);

        let buffer = table.get_mut(id).unwrap();
        assert_eq!(buffer.clean(), 3);
        assert_eq!(buffer.clean(), 0);
        assert_eq!(table.dirty_contribution(), 0);
    }

    #[test]
    fn descending_order_is_maintained() {
        let table = table_with(&[(0, PAGE), (8 * PAGE, PAGE), (4 * PAGE, PAGE)]);
        assert_eq!(
            table.offsets_descending(),
            vec![8 * PAGE, 4 * PAGE, 0]
        );
    }

    #[test]
    fn mask_feeds_dirty_contribution() {
        let mut table = BufferTable::new();
        table.mask_mut().set_range(3, 5, None);
        assert_eq!(table.dirty_contribution(), 3);
    }

    #[test]
    fn oldest_seq_spans_buffers_and_mask() {
        let mut table = table_with(&[(0, PAGE)]);
        let id = table.ids_descending()[0];
        table.get_mut(id).unwrap().mark_dirty(Some(40));
        table.mask_mut().set_range(9, 9, Some(25));
        assert_eq!(table.oldest_seq(), Some(25));
    }
}
