//! # Per-Stream View Index
//!
//! Maps window-aligned file offsets to pool views. Small streams use a flat
//! array (with a few inline slots, so a 1 MiB stream indexes without heap
//! allocation); streams past 32 MiB convert to a sparse 128-way radix tree
//! whose interior nodes are created on demand and freed the moment they hold
//! nothing.
//!
//! ## Sparse Tree Shape
//!
//! Each tree level decodes `LEVEL_SHIFT` (7) bits of the window number, most
//! significant first. A lookup therefore costs one array index per level, and
//! a stream's depth grows only with its section size; a 63-bit offset space
//! needs at most `MAX_INDEX_LEVELS` (7) levels. When the section grows past
//! the current depth's reach, a new root is pushed on top whose sole child is
//! the previous root; pointers already resolved below it stay valid.
//!
//! ## Collapse-On-Empty
//!
//! Every node counts its live entries. `clear` walks down, empties the leaf
//! slot, then frees each node on the way back up that reached zero, so a
//! non-root node with no live entries never stays linked. The root is kept
//! even when empty (its depth encodes the section size).
//!
//! ## Sentinels
//!
//! A slot can hold two values besides a view: `Reserved` pins the path (the
//! view-pool miss path sets it before dropping the pool lock, so the nodes it
//! is about to install into cannot be collapsed underneath it), and
//! `Released` travels through [`StreamIndex::set`] as the matching un-pin
//! instruction: it clears a still-`Reserved` slot and collapses the path,
//! and is never observed at rest. Both flow through the same set/clear code
//! as real views.
//!
//! ## No Allocation Under The Pool Lock
//!
//! `set` never allocates: interior nodes come from a [`NodeZone`] the caller
//! prefills *before* entering the critical section. A zone of
//! `MAX_INDEX_LEVELS` nodes is always enough for one set.
//!
//! ## Synchronization
//!
//! None here. The index is owned by the view pool and every call happens
//! under the pool lock; this module is pure data structure.

use eyre::{bail, Result};
use smallvec::SmallVec;

use crate::config::{
    FLAT_INDEX_MAX, INLINE_INDEX_SLOTS, LEVEL_FANOUT, LEVEL_SHIFT, MAX_INDEX_LEVELS, WINDOW_SIZE,
};
use crate::error::CacheError;
use crate::view::ViewId;

/// Value stored at one window slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Nothing mapped and nothing holding the path.
    Empty,
    /// A live pool view covers this window.
    View(ViewId),
    /// The path is pinned without a real view (a mapping is in flight).
    Reserved,
    /// Un-pin instruction: never stored, only passed to [`StreamIndex::set`].
    Released,
}

enum Entry {
    Empty,
    Child(Box<IndexNode>),
    View(ViewId),
    Reserved,
}

impl Entry {
    fn is_empty(&self) -> bool {
        matches!(self, Entry::Empty)
    }
}

struct IndexNode {
    entries: [Entry; LEVEL_FANOUT],
    /// Count of non-empty entries (children, views and reservations alike).
    live: u32,
}

impl IndexNode {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: std::array::from_fn(|_| Entry::Empty),
            live: 0,
        })
    }
}

/// Pre-allocated interior nodes, filled outside the pool lock so that
/// [`StreamIndex::set`] cannot allocate (or fail to) inside it.
pub struct NodeZone {
    nodes: SmallVec<[Box<IndexNode>; MAX_INDEX_LEVELS]>,
}

impl NodeZone {
    pub fn new() -> Self {
        Self {
            nodes: SmallVec::new(),
        }
    }

    /// Tops the zone up to `count` nodes. Call before the critical section.
    pub fn prefill(&mut self, count: usize) {
        while self.nodes.len() < count {
            self.nodes.push(IndexNode::new());
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn take(&mut self) -> Result<Box<IndexNode>> {
        match self.nodes.pop() {
            Some(node) => Ok(node),
            None => bail!(CacheError::InconsistentState {
                detail: "index node zone drained inside the critical section",
            }),
        }
    }
}

impl Default for NodeZone {
    fn default() -> Self {
        Self::new()
    }
}

enum Root {
    Flat(SmallVec<[Slot; INLINE_INDEX_SLOTS]>),
    Tree { node: Box<IndexNode>, levels: usize },
}

/// Sparse map from window number to [`Slot`] for one stream.
pub struct StreamIndex {
    section_size: u64,
    root: Root,
}

/// Number of windows needed to cover `size` bytes.
pub fn windows_for(size: u64) -> u64 {
    size.div_ceil(WINDOW_SIZE)
}

/// Tree depth needed to address `size` bytes of section.
fn levels_for(size: u64) -> usize {
    let windows = windows_for(size);
    let mut levels = 1;
    let mut reach = LEVEL_FANOUT as u64;
    while reach < windows {
        levels += 1;
        reach = reach.saturating_mul(LEVEL_FANOUT as u64);
    }
    levels
}

impl StreamIndex {
    /// Builds an index for a stream whose section is `section_size` bytes.
    /// Large sections start out as a tree; the root node (if any) comes from
    /// `zone`.
    pub fn new(section_size: u64, zone: &mut NodeZone) -> Result<Self> {
        let root = if section_size <= FLAT_INDEX_MAX {
            Root::Flat(SmallVec::new())
        } else {
            Root::Tree {
                node: zone.take()?,
                levels: levels_for(section_size),
            }
        };
        Ok(Self { section_size, root })
    }

    pub fn section_size(&self) -> u64 {
        self.section_size
    }

    /// Looks up the slot covering `window` (a window number, not a byte
    /// offset). Windows beyond the section are `Empty`.
    pub fn lookup(&self, window: u64) -> Slot {
        if window >= windows_for(self.section_size) {
            return Slot::Empty;
        }
        match &self.root {
            Root::Flat(slots) => slots.get(window as usize).copied().unwrap_or(Slot::Empty),
            Root::Tree { node, levels } => {
                let mut current = node.as_ref();
                for level in (1..*levels).rev() {
                    let digit = Self::digit(window, level);
                    match &current.entries[digit] {
                        Entry::Child(child) => current = child,
                        Entry::Empty => return Slot::Empty,
                        Entry::View(_) | Entry::Reserved => {
                            debug_assert!(false, "leaf value at interior level");
                            return Slot::Empty;
                        }
                    }
                }
                match &current.entries[Self::digit(window, 0)] {
                    Entry::Empty => Slot::Empty,
                    Entry::View(id) => Slot::View(*id),
                    Entry::Reserved => Slot::Reserved,
                    Entry::Child(_) => {
                        debug_assert!(false, "child node at leaf level");
                        Slot::Empty
                    }
                }
            }
        }
    }

    /// Stores `value` at `window`. `Slot::Empty` behaves like [`clear`];
    /// `Slot::Released` clears the slot only if it is still `Reserved`
    /// (the un-pin instruction of a failed mapping). Interior nodes come
    /// from `zone`; prefill it with [`MAX_INDEX_LEVELS`] nodes beforehand.
    ///
    /// [`clear`]: StreamIndex::clear
    pub fn set(&mut self, window: u64, value: Slot, zone: &mut NodeZone) -> Result<()> {
        if window >= windows_for(self.section_size) {
            bail!(CacheError::InconsistentState {
                detail: "index set beyond the stream's section",
            });
        }

        match value {
            Slot::Empty => {
                self.clear(window);
                Ok(())
            }
            Slot::Released => {
                if self.lookup(window) == Slot::Reserved {
                    self.clear(window);
                }
                Ok(())
            }
            Slot::View(_) | Slot::Reserved => match &mut self.root {
                Root::Flat(slots) => {
                    let at = window as usize;
                    if slots.len() <= at {
                        slots.resize(at + 1, Slot::Empty);
                    }
                    slots[at] = value;
                    Ok(())
                }
                Root::Tree { node, levels } => {
                    Self::set_in_tree(node, *levels, window, value, zone)
                }
            },
        }
    }

    fn set_in_tree(
        node: &mut IndexNode,
        levels: usize,
        window: u64,
        value: Slot,
        zone: &mut NodeZone,
    ) -> Result<()> {
        let mut current = node;
        for level in (1..levels).rev() {
            let digit = Self::digit(window, level);
            if current.entries[digit].is_empty() {
                current.entries[digit] = Entry::Child(zone.take()?);
                current.live += 1;
            }
            current = match &mut current.entries[digit] {
                Entry::Child(child) => child,
                _ => bail!(CacheError::InconsistentState {
                    detail: "leaf value at interior index level",
                }),
            };
        }

        let digit = Self::digit(window, 0);
        let leaf = &mut current.entries[digit];
        if leaf.is_empty() {
            current.live += 1;
        }
        *leaf = match value {
            Slot::View(id) => Entry::View(id),
            Slot::Reserved => Entry::Reserved,
            Slot::Empty | Slot::Released => unreachable!("handled by set"),
        };
        Ok(())
    }

    /// Empties the slot at `window`, returning its previous value, and frees
    /// every interior node the removal left empty.
    pub fn clear(&mut self, window: u64) -> Slot {
        if window >= windows_for(self.section_size) {
            return Slot::Empty;
        }
        match &mut self.root {
            Root::Flat(slots) => {
                let at = window as usize;
                if at < slots.len() {
                    std::mem::replace(&mut slots[at], Slot::Empty)
                } else {
                    Slot::Empty
                }
            }
            Root::Tree { node, levels } => {
                let (old, _emptied) = Self::clear_in_tree(node, *levels - 1, window);
                old
            }
        }
    }

    /// Recursive clear. Returns the old slot value and whether `node` itself
    /// ended up empty (so the parent can unlink and free it).
    fn clear_in_tree(node: &mut IndexNode, level: usize, window: u64) -> (Slot, bool) {
        let digit = Self::digit(window, level);

        if level == 0 {
            let old = match std::mem::replace(&mut node.entries[digit], Entry::Empty) {
                Entry::Empty => Slot::Empty,
                Entry::View(id) => Slot::View(id),
                Entry::Reserved => Slot::Reserved,
                Entry::Child(_) => {
                    debug_assert!(false, "child node at leaf level");
                    Slot::Empty
                }
            };
            if old != Slot::Empty {
                node.live -= 1;
            }
            return (old, node.live == 0);
        }

        let (old, child_emptied) = match &mut node.entries[digit] {
            Entry::Child(child) => Self::clear_in_tree(child, level - 1, window),
            Entry::Empty => return (Slot::Empty, node.live == 0),
            Entry::View(_) | Entry::Reserved => {
                debug_assert!(false, "leaf value at interior level");
                return (Slot::Empty, node.live == 0);
            }
        };

        if child_emptied {
            node.entries[digit] = Entry::Empty;
            node.live -= 1;
        }
        (old, node.live == 0)
    }

    /// Grows the index for a section extension. Converts flat to tree when
    /// the section crosses [`FLAT_INDEX_MAX`], then pushes root levels until
    /// the tree reaches the new size. Entries already resolved keep their
    /// position; nothing is copied but the flat slots on conversion.
    pub fn extend(&mut self, new_section_size: u64, zone: &mut NodeZone) -> Result<()> {
        if new_section_size <= self.section_size {
            self.section_size = self.section_size.max(new_section_size);
            return Ok(());
        }

        if new_section_size > FLAT_INDEX_MAX {
            if let Root::Flat(slots) = &mut self.root {
                let mut node = zone.take()?;
                for (at, slot) in slots.iter().enumerate() {
                    node.entries[at] = match slot {
                        Slot::Empty => Entry::Empty,
                        Slot::View(id) => Entry::View(*id),
                        Slot::Reserved => Entry::Reserved,
                        Slot::Released => unreachable!("never stored"),
                    };
                    if *slot != Slot::Empty {
                        node.live += 1;
                    }
                }
                self.root = Root::Tree { node, levels: 1 };
            }
        }

        if let Root::Tree { node, levels } = &mut self.root {
            let target = levels_for(new_section_size);
            while *levels < target {
                // The previous root becomes digit 0 of the new root, so
                // pointers resolved below it stay valid.
                let old_root = std::mem::replace(node, zone.take()?);
                node.entries[0] = Entry::Child(old_root);
                node.live = 1;
                *levels += 1;
            }
        }

        self.section_size = new_section_size;
        Ok(())
    }

    /// Shrinks the addressable range after truncation. Slots beyond the new
    /// section must already have been cleared by the caller.
    pub fn truncate(&mut self, new_section_size: u64) {
        debug_assert!(new_section_size <= self.section_size);
        self.section_size = new_section_size;
        if let Root::Flat(slots) = &mut self.root {
            let keep = windows_for(new_section_size) as usize;
            if slots.len() > keep {
                slots.truncate(keep);
            }
        }
    }

    /// True when no slot holds a view or reservation.
    pub fn is_unused(&self) -> bool {
        match &self.root {
            Root::Flat(slots) => slots.iter().all(|s| *s == Slot::Empty),
            Root::Tree { node, .. } => node.live == 0,
        }
    }

    /// Interior + root node count; exercised by the collapse tests.
    pub fn node_count(&self) -> usize {
        fn count(node: &IndexNode) -> usize {
            1 + node
                .entries
                .iter()
                .map(|e| match e {
                    Entry::Child(child) => count(child),
                    _ => 0,
                })
                .sum::<usize>()
        }
        match &self.root {
            Root::Flat(_) => 0,
            Root::Tree { node, .. } => count(node),
        }
    }

    fn digit(window: u64, level: usize) -> usize {
        ((window >> (LEVEL_SHIFT as usize * level)) & (LEVEL_FANOUT as u64 - 1)) as usize
    }
}

/// Zone nodes sufficient for any single `set` plus any single `extend`: one
/// node per level for the set path, plus the flat-conversion node.
pub const ZONE_BUDGET: usize = MAX_INDEX_LEVELS + 1;
