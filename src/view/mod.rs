//! # Global View Pool
//!
//! A fixed-size arena of reusable mapped-window slots. Every cached stream
//! reads and writes through views acquired here; the pool is what bounds the
//! engine's total address-space consumption no matter how many streams are
//! cached or how large they are.
//!
//! ## View States
//!
//! Each view is in exactly one of three states, and the three sets partition
//! the pool capacity at all times:
//!
//! - **free**: unowned, unmapped, on the free stack
//! - **idle**: owned and mapped, active count zero, on the LRU list,
//!   eligible for reuse by anyone
//! - **in-use**: active count above zero, on neither list, never touched
//!
//! ## Reuse and Theft
//!
//! A miss first pops the free stack. Failing that it takes the head of the
//! LRU list; the victim may belong to a *different* stream, in which case it
//! is unlinked from that stream's index before being remapped; the owning
//! stream simply misses on its next access. Only idle views are ever stolen;
//! an actively pinned view cannot be a victim because it is not on the LRU
//! list at all.
//!
//! ## The Mapping Race
//!
//! The pool lock is never held across a mapper call, so two threads can miss
//! on the same (stream, window) and both map it. On re-acquiring the lock the
//! loser finds the winner's view already installed, adopts it (bumping its
//! active count), unmaps its own fresh window and returns its slot to the
//! free stack. Before dropping the lock, the miss path pins the target path
//! in the index with `Slot::Reserved` so a concurrent teardown of unrelated
//! entries cannot collapse the nodes it is about to install into; a failed
//! mapping undoes the pin with `Slot::Released`.
//!
//! ## Release-Behind
//!
//! Streams flagged as forward-scanning call [`ViewPool::release_behind`]
//! after each acquire: idle windows more than a couple of windows behind the
//! scan position are unmapped eagerly, bounding the per-stream working set
//! without waiting for LRU pressure.
//!
//! ## Locking
//!
//! One mutex guards the arena, both lists and every stream index. Mapper
//! calls happen strictly outside it. Releases that drop a stream's last
//! active view signal a condvar that stream teardown waits on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::{UNMAP_BEHIND_WINDOWS, WINDOW_SHIFT, WINDOW_SIZE};
use crate::error::CacheError;
use crate::index::{NodeZone, Slot, StreamIndex, ZONE_BUDGET};
use crate::mapper::{MappingId, ViewMapper, WindowToken};

/// Identifies one cached stream. Allocated by the registry.
pub type StreamId = u64;

/// Index of a view slot in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(pub(crate) u32);

const NIL: u32 = u32::MAX;

/// A successfully acquired view. The caller owes one [`ViewPool::release`].
#[derive(Debug, Clone, Copy)]
pub struct AcquiredView {
    pub view: ViewId,
    pub token: WindowToken,
    pub window_offset: u64,
    pub mapped_len: usize,
}

struct View {
    owner: Option<StreamId>,
    window_offset: u64,
    active: u16,
    lru_prev: u32,
    lru_next: u32,
    token: Option<WindowToken>,
    mapped_len: usize,
}

impl View {
    fn unowned() -> Self {
        Self {
            owner: None,
            window_offset: 0,
            active: 0,
            lru_prev: NIL,
            lru_next: NIL,
            token: None,
            mapped_len: 0,
        }
    }
}

struct StreamViews {
    index: StreamIndex,
    mapping: MappingId,
    section_size: u64,
    /// Views of this stream with active count above zero.
    active_views: usize,
}

struct PoolInner {
    views: Vec<View>,
    free: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    streams: HashMap<StreamId, StreamViews>,
}

impl PoolInner {
    fn lru_push_tail(&mut self, at: u32) {
        let v = &mut self.views[at as usize];
        v.lru_prev = self.lru_tail;
        v.lru_next = NIL;
        if self.lru_tail != NIL {
            self.views[self.lru_tail as usize].lru_next = at;
        } else {
            self.lru_head = at;
        }
        self.lru_tail = at;
    }

    fn lru_remove(&mut self, at: u32) {
        let (prev, next) = {
            let v = &mut self.views[at as usize];
            let links = (v.lru_prev, v.lru_next);
            v.lru_prev = NIL;
            v.lru_next = NIL;
            links
        };
        if prev != NIL {
            self.views[prev as usize].lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.views[next as usize].lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
    }

    fn lru_pop_head(&mut self) -> Option<u32> {
        let head = self.lru_head;
        if head == NIL {
            return None;
        }
        self.lru_remove(head);
        Some(head)
    }

    fn lru_len(&self) -> usize {
        let mut n = 0;
        let mut at = self.lru_head;
        while at != NIL {
            n += 1;
            at = self.views[at as usize].lru_next;
        }
        n
    }

    /// Drops one active reference on a stream's bookkeeping, reporting
    /// whether the stream just went fully idle.
    fn stream_went_idle(&mut self, stream: StreamId) -> bool {
        if let Some(sv) = self.streams.get_mut(&stream) {
            debug_assert!(sv.active_views > 0, "stream active count underflow");
            sv.active_views = sv.active_views.saturating_sub(1);
            sv.active_views == 0
        } else {
            false
        }
    }
}

/// Counts of the three view states; the sum always equals the capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPartition {
    pub free: usize,
    pub idle: usize,
    pub in_use: usize,
}

/// The bounded global pool of mapped-window views.
pub struct ViewPool {
    mapper: Arc<dyn ViewMapper>,
    capacity: usize,
    inner: Mutex<PoolInner>,
    drained: Condvar,
}

impl ViewPool {
    pub fn new(mapper: Arc<dyn ViewMapper>, capacity: usize) -> Self {
        let views = (0..capacity).map(|_| View::unowned()).collect();
        let free = (0..capacity as u32).rev().collect();
        Self {
            mapper,
            capacity,
            inner: Mutex::new(PoolInner {
                views,
                free,
                lru_head: NIL,
                lru_tail: NIL,
                streams: HashMap::new(),
            }),
            drained: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers a stream's index with the pool. Must precede any acquire
    /// for that stream.
    pub fn attach_stream(
        &self,
        stream: StreamId,
        mapping: MappingId,
        section_size: u64,
    ) -> Result<()> {
        let mut zone = NodeZone::new();
        zone.prefill(ZONE_BUDGET);
        let index = StreamIndex::new(section_size, &mut zone)?;

        let mut inner = self.inner.lock();
        if inner.streams.contains_key(&stream) {
            bail!(CacheError::InconsistentState {
                detail: "stream attached to the view pool twice",
            });
        }
        inner.streams.insert(
            stream,
            StreamViews {
                index,
                mapping,
                section_size,
                active_views: 0,
            },
        );
        Ok(())
    }

    /// Grows a stream's section, deepening its index as needed.
    pub fn extend_stream(&self, stream: StreamId, new_section_size: u64) -> Result<()> {
        let mut zone = NodeZone::new();
        zone.prefill(ZONE_BUDGET);

        let mut inner = self.inner.lock();
        let sv = match inner.streams.get_mut(&stream) {
            Some(sv) => sv,
            None => bail!(CacheError::InconsistentState {
                detail: "extend of a stream unknown to the view pool",
            }),
        };
        sv.index.extend(new_section_size, &mut zone)?;
        sv.section_size = sv.section_size.max(new_section_size);
        Ok(())
    }

    /// Acquires a view covering the window containing `offset`, mapping one
    /// on a miss (possibly stealing the least-recently-used idle view from
    /// any stream). Returns the view and how many bytes it maps.
    pub fn acquire(&self, stream: StreamId, offset: u64) -> Result<AcquiredView> {
        let window_offset = offset & !(WINDOW_SIZE - 1);
        let window = window_offset >> WINDOW_SHIFT;
        let mut zone = NodeZone::new();

        // Outcome of the locked section when the lookup missed.
        struct Miss {
            victim: u32,
            old_token: Option<WindowToken>,
            mapping: MappingId,
        }

        // Filled outside the lock so the locked section never allocates
        // index nodes.
        zone.prefill(ZONE_BUDGET);

        let miss = {
            let mut inner = self.inner.lock();
            let sv = match inner.streams.get(&stream) {
                Some(sv) => sv,
                None => bail!(CacheError::InconsistentState {
                    detail: "acquire on a stream unknown to the view pool",
                }),
            };
            if window_offset >= sv.section_size {
                bail!(CacheError::SizeTooLarge {
                    requested: window_offset,
                    limit: sv.section_size,
                });
            }

            match sv.index.lookup(window) {
                Slot::View(id) => {
                    return Ok(self.bump_locked(&mut inner, stream, id));
                }
                Slot::Empty | Slot::Reserved => {
                    // Miss. Pick a victim before dropping the lock.
                    let victim = match inner.free.pop().or_else(|| inner.lru_pop_head()) {
                        Some(at) => at,
                        None => bail!(CacheError::ResourceExhausted {
                            resource: "view pool",
                            capacity: self.capacity,
                        }),
                    };

                    // Steal: unlink the victim from its previous owner.
                    let (old_owner, old_window, old_token) = {
                        let v = &inner.views[victim as usize];
                        debug_assert_eq!(v.active, 0, "stole an in-use view");
                        (v.owner, v.window_offset, v.token)
                    };
                    if let Some(owner) = old_owner {
                        if let Some(osv) = inner.streams.get_mut(&owner) {
                            osv.index.clear(old_window >> WINDOW_SHIFT);
                        }
                        trace!(victim, ?owner, old_window, "stole idle view");
                    }

                    let PoolInner { views, streams, .. } = &mut *inner;
                    let sv = streams.get_mut(&stream).expect("checked above");

                    // Pin the path while the lock is down, and claim the slot
                    // as in-use so the partition invariant holds mid-flight.
                    sv.index.set(window, Slot::Reserved, &mut zone)?;
                    sv.active_views += 1;
                    let v = &mut views[victim as usize];
                    v.owner = Some(stream);
                    v.window_offset = window_offset;
                    v.active = 1;
                    v.token = None;
                    v.mapped_len = 0;

                    Miss {
                        victim,
                        old_token,
                        mapping: sv.mapping,
                    }
                }
                Slot::Released => unreachable!("never stored in the index"),
            }
        };

        // Blocking mapper work, lock dropped.
        if let Some(token) = miss.old_token {
            self.mapper.unmap_window(token, false);
        }
        let mapped = self.mapper.map_window(miss.mapping, window_offset);

        // The reservation may have been consumed and cleared by a racer, so
        // the install below can need a full path's worth of nodes again.
        zone.prefill(ZONE_BUDGET);

        let mut inner = self.inner.lock();
        let sv = match inner.streams.get_mut(&stream) {
            Some(sv) => sv,
            None => bail!(CacheError::InconsistentState {
                detail: "stream detached from the pool during acquire",
            }),
        };

        match sv.index.lookup(window) {
            Slot::View(existing) => {
                // Lost the mapping race: adopt the winner's view, give our
                // slot back, and throw away our fresh mapping.
                let adopted = self.bump_locked(&mut inner, stream, existing);
                self.surrender_claim(&mut inner, stream, miss.victim);
                drop(inner);
                if let Ok(fresh) = mapped {
                    self.mapper.unmap_window(fresh.token, false);
                }
                debug!(stream, window_offset, "adopted concurrently mapped view");
                Ok(adopted)
            }
            _ => match mapped {
                Ok(fresh) => {
                    sv.index.set(window, Slot::View(ViewId(miss.victim)), &mut zone)?;
                    let v = &mut inner.views[miss.victim as usize];
                    v.token = Some(fresh.token);
                    v.mapped_len = fresh.len;
                    Ok(AcquiredView {
                        view: ViewId(miss.victim),
                        token: fresh.token,
                        window_offset,
                        mapped_len: fresh.len,
                    })
                }
                Err(err) => {
                    sv.index.set(window, Slot::Released, &mut zone)?;
                    self.surrender_claim(&mut inner, stream, miss.victim);
                    drop(inner);
                    Err(err.wrap_err(CacheError::MappingFailed {
                        operation: "map_window",
                    }))
                }
            },
        }
    }

    /// Bumps an indexed view's active count under the lock.
    fn bump_locked(
        &self,
        inner: &mut PoolInner,
        stream: StreamId,
        id: ViewId,
    ) -> AcquiredView {
        let at = id.0;
        if inner.views[at as usize].active == 0 {
            inner.lru_remove(at);
            if let Some(sv) = inner.streams.get_mut(&stream) {
                sv.active_views += 1;
            }
        }
        let v = &mut inner.views[at as usize];
        debug_assert_eq!(v.owner, Some(stream));
        v.active += 1;
        AcquiredView {
            view: id,
            token: v.token.expect("indexed view is always mapped"),
            window_offset: v.window_offset,
            mapped_len: v.mapped_len,
        }
    }

    /// Returns a mid-flight claimed slot to the free stack.
    fn surrender_claim(&self, inner: &mut PoolInner, stream: StreamId, at: u32) {
        let v = &mut inner.views[at as usize];
        debug_assert_eq!(v.active, 1);
        *v = View::unowned();
        inner.free.push(at);
        if inner.stream_went_idle(stream) {
            self.drained.notify_all();
        }
    }

    /// Drops one reference. The view becomes reusable (LRU tail) when its
    /// count reaches zero; a stream whose last active view drains signals
    /// waiting teardowns.
    pub fn release(&self, view: ViewId) {
        let mut inner = self.inner.lock();
        let at = view.0;
        let owner = {
            let v = &mut inner.views[at as usize];
            debug_assert!(v.active > 0, "release of an idle view");
            v.active -= 1;
            if v.active > 0 {
                return;
            }
            v.owner
        };
        inner.lru_push_tail(at);
        if let Some(stream) = owner {
            if inner.stream_went_idle(stream) {
                self.drained.notify_all();
            }
        }
    }

    /// Window token and mapped length of a view the caller holds active.
    pub fn window(&self, view: ViewId) -> Result<(WindowToken, usize)> {
        let inner = self.inner.lock();
        let v = &inner.views[view.0 as usize];
        debug_assert!(v.active > 0, "window access on an idle view");
        match v.token {
            Some(token) => Ok((token, v.mapped_len)),
            None => bail!(CacheError::InconsistentState {
                detail: "window access on an unmapped view",
            }),
        }
    }

    /// True when a live view covers `offset` for `stream`.
    pub fn contains(&self, stream: StreamId, offset: u64) -> bool {
        let inner = self.inner.lock();
        inner
            .streams
            .get(&stream)
            .map(|sv| matches!(sv.index.lookup(offset >> WINDOW_SHIFT), Slot::View(_)))
            .unwrap_or(false)
    }

    /// Unmaps idle windows of a forward-scanning stream that lie more than
    /// [`UNMAP_BEHIND_WINDOWS`] behind `offset`. Returns how many were freed.
    pub fn release_behind(&self, stream: StreamId, offset: u64) -> usize {
        let window_offset = offset & !(WINDOW_SIZE - 1);
        let cutoff = match window_offset.checked_sub(UNMAP_BEHIND_WINDOWS * WINDOW_SIZE) {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let tokens = self.reclaim_idle(stream, |woff| woff < cutoff);
        let freed = tokens.len();
        for token in tokens {
            self.mapper.unmap_window(token, true);
        }
        if freed > 0 {
            trace!(stream, offset, freed, "released windows behind scan");
        }
        freed
    }

    /// Unmaps every idle view of `stream` at or past `from_offset`. Returns
    /// false (detaching nothing) if an in-use view lies in the range.
    pub fn detach_range(&self, stream: StreamId, from_offset: u64) -> bool {
        {
            let inner = self.inner.lock();
            let busy = inner.views.iter().any(|v| {
                v.owner == Some(stream) && v.active > 0 && v.window_offset >= from_offset
            });
            if busy {
                return false;
            }
        }
        let tokens = self.reclaim_idle(stream, |woff| woff >= from_offset);
        for token in tokens {
            self.mapper.unmap_window(token, false);
        }
        true
    }

    /// Removes `stream` from the pool entirely. Every view of the stream
    /// must already be idle (wait with [`ViewPool::wait_drained`]).
    pub fn detach_stream(&self, stream: StreamId) -> Result<()> {
        if !self.detach_range(stream, 0) {
            bail!(CacheError::InconsistentState {
                detail: "stream detached while views are still active",
            });
        }
        let mut inner = self.inner.lock();
        if let Some(sv) = inner.streams.remove(&stream) {
            debug_assert!(sv.index.is_unused(), "detached stream still indexes views");
            debug_assert_eq!(sv.active_views, 0);
        }
        Ok(())
    }

    /// Collects and unlinks idle views of `stream` whose window offset
    /// matches `select`, returning their tokens for unmapping.
    fn reclaim_idle(&self, stream: StreamId, select: impl Fn(u64) -> bool) -> Vec<WindowToken> {
        let mut inner = self.inner.lock();
        let mut reclaimed = Vec::new();

        for at in 0..inner.views.len() as u32 {
            let (owner, active, woff) = {
                let v = &inner.views[at as usize];
                (v.owner, v.active, v.window_offset)
            };
            if owner != Some(stream) || active > 0 || !select(woff) {
                continue;
            }

            inner.lru_remove(at);
            let token = {
                let v = &mut inner.views[at as usize];
                let token = v.token.take();
                *v = View::unowned();
                token
            };
            inner.free.push(at);
            if let Some(sv) = inner.streams.get_mut(&stream) {
                sv.index.clear(woff >> WINDOW_SHIFT);
            }
            if let Some(token) = token {
                reclaimed.push(token);
            }
        }
        reclaimed
    }

    /// Blocks until every view of `stream` is idle. With a timeout, returns
    /// whether the stream drained in time.
    pub fn wait_drained(&self, stream: StreamId, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            let active = inner
                .streams
                .get(&stream)
                .map(|sv| sv.active_views)
                .unwrap_or(0);
            if active == 0 {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.drained.wait_until(&mut inner, deadline).timed_out() {
                        return inner
                            .streams
                            .get(&stream)
                            .map(|sv| sv.active_views == 0)
                            .unwrap_or(true);
                    }
                }
                None => self.drained.wait(&mut inner),
            }
        }
    }

    /// Number of currently active views of `stream`.
    pub fn active_views(&self, stream: StreamId) -> usize {
        self.inner
            .lock()
            .streams
            .get(&stream)
            .map(|sv| sv.active_views)
            .unwrap_or(0)
    }

    /// Snapshot of the three-way state partition. The sum of the counts
    /// equals the capacity by construction; tests assert it stays that way.
    pub fn partition(&self) -> PoolPartition {
        let inner = self.inner.lock();
        let free = inner.free.len();
        let idle = inner.lru_len();
        let in_use = inner.views.iter().filter(|v| v.active > 0).count();
        debug_assert_eq!(free + idle + in_use, self.capacity);
        PoolPartition { free, idle, in_use }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::HeapMapper;

    fn pool(capacity: usize) -> (Arc<HeapMapper>, ViewPool) {
        let mapper = Arc::new(HeapMapper::new());
        let pool = ViewPool::new(Arc::clone(&mapper) as Arc<dyn ViewMapper>, capacity);
        (mapper, pool)
    }

    fn attach(pool: &ViewPool, mapper: &HeapMapper, stream: StreamId, size: u64) -> MappingId {
        let mapping = mapper.create_mapping(size).unwrap();
        pool.attach_stream(stream, mapping, size).unwrap();
        mapping
    }

    #[test]
    fn acquire_hit_returns_same_view() {
        let (mapper, pool) = pool(4);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 4);

        let a = pool.acquire(1, 0).unwrap();
        let b = pool.acquire(1, 4096).unwrap();
        assert_eq!(a.view, b.view);
        assert_eq!(a.token, b.token);

        pool.release(a.view);
        pool.release(b.view);
        assert_eq!(pool.partition(), PoolPartition { free: 3, idle: 1, in_use: 0 });
    }

    #[test]
    fn mapped_len_clamps_to_section_end() {
        let (mapper, pool) = pool(4);
        attach(&pool, &mapper, 1, WINDOW_SIZE + 4096);

        let v = pool.acquire(1, WINDOW_SIZE).unwrap();
        assert_eq!(v.mapped_len, 4096);
        pool.release(v.view);
    }

    #[test]
    fn eviction_reuses_least_recently_used_idle_view() {
        let (mapper, pool) = pool(2);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 8);

        let a = pool.acquire(1, 0).unwrap();
        let b = pool.acquire(1, WINDOW_SIZE).unwrap();
        pool.release(a.view);
        pool.release(b.view);

        // Third window steals the oldest idle view (window 0).
        let c = pool.acquire(1, WINDOW_SIZE * 2).unwrap();
        assert_eq!(c.view, a.view);
        assert!(!pool.contains(1, 0));
        assert!(pool.contains(1, WINDOW_SIZE));
        assert!(pool.contains(1, WINDOW_SIZE * 2));
        pool.release(c.view);

        assert_eq!(mapper.active_windows(), 2);
    }

    #[test]
    fn pinned_views_are_never_stolen() {
        let (mapper, pool) = pool(2);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 8);

        let a = pool.acquire(1, 0).unwrap();
        let b = pool.acquire(1, WINDOW_SIZE).unwrap();

        // Both views active: a third window has no victim.
        let err = pool.acquire(1, WINDOW_SIZE * 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::ResourceExhausted { .. })
        ));

        pool.release(b.view);
        let c = pool.acquire(1, WINDOW_SIZE * 2).unwrap();
        assert_eq!(c.view, b.view);
        assert!(pool.contains(1, 0), "active view must survive the steal");
        pool.release(a.view);
        pool.release(c.view);
    }

    #[test]
    fn steal_crosses_streams() {
        let (mapper, pool) = pool(1);
        attach(&pool, &mapper, 1, WINDOW_SIZE);
        attach(&pool, &mapper, 2, WINDOW_SIZE);

        let a = pool.acquire(1, 0).unwrap();
        pool.release(a.view);
        assert!(pool.contains(1, 0));

        let b = pool.acquire(2, 0).unwrap();
        assert!(!pool.contains(1, 0), "victim unlinked from old owner");
        assert!(pool.contains(2, 0));
        pool.release(b.view);

        pool.detach_stream(2).unwrap();
        pool.detach_stream(1).unwrap();
        assert_eq!(mapper.active_windows(), 0);
    }

    #[test]
    fn release_behind_unmaps_old_windows() {
        let (mapper, pool) = pool(8);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 8);

        for i in 0..4 {
            let v = pool.acquire(1, i * WINDOW_SIZE).unwrap();
            pool.release(v.view);
        }
        assert_eq!(mapper.active_windows(), 4);

        let freed = pool.release_behind(1, 3 * WINDOW_SIZE);
        assert_eq!(freed, 1, "window 0 is the only one beyond the cutoff");
        assert!(!pool.contains(1, 0));
        assert!(pool.contains(1, WINDOW_SIZE));
    }

    #[test]
    fn detach_range_refuses_active_views() {
        let (mapper, pool) = pool(4);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 4);

        let v = pool.acquire(1, 0).unwrap();
        assert!(!pool.detach_range(1, 0));

        pool.release(v.view);
        assert!(pool.detach_range(1, 0));
        assert_eq!(mapper.active_windows(), 0);
    }

    #[test]
    fn wait_drained_times_out_while_active() {
        let (mapper, pool) = pool(4);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 4);

        let v = pool.acquire(1, 0).unwrap();
        assert!(!pool.wait_drained(1, Some(Duration::from_millis(10))));
        pool.release(v.view);
        assert!(pool.wait_drained(1, Some(Duration::from_millis(10))));
    }

    #[test]
    fn partition_always_sums_to_capacity() {
        let (mapper, pool) = pool(3);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 8);

        let p = pool.partition();
        assert_eq!(p.free + p.idle + p.in_use, 3);

        let a = pool.acquire(1, 0).unwrap();
        let p = pool.partition();
        assert_eq!((p.free, p.idle, p.in_use), (2, 0, 1));

        pool.release(a.view);
        let p = pool.partition();
        assert_eq!((p.free, p.idle, p.in_use), (2, 1, 0));
    }

    #[test]
    fn concurrent_acquires_of_one_window_converge() {
        use std::sync::Barrier;

        let (mapper, pool) = pool(8);
        attach(&pool, &mapper, 1, WINDOW_SIZE * 8);
        let pool = Arc::new(pool);

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let v = pool.acquire(1, WINDOW_SIZE).unwrap();
                    let id = v.view;
                    pool.release(id);
                    id
                })
            })
            .collect();

        let ids: Vec<ViewId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]), "all callers adopt one view");
        assert_eq!(mapper.active_windows(), 1, "losers unmapped their copies");

        let p = pool.partition();
        assert_eq!(p.free + p.idle + p.in_use, 8);
        assert_eq!(p.idle, 1);
    }
}
