//! # Stream Registry
//!
//! Lifecycle and visibility of stream objects: the file-key map, the ordered
//! clean and dirty collections the external write-behind scheduler consumes,
//! and the teardown waiter list.
//!
//! ## Creation Collisions
//!
//! Concurrent initializations of one file race to insert; exactly one wins
//! and builds the stream (mapping creation happens outside the registry
//! lock). The losers wait on the creation condvar and adopt the winner's
//! stream, contributing their open count to it. A failed creation removes
//! the placeholder and wakes the losers so they can race again.
//!
//! ## Clean/Dirty Lists And The Scan Cursor
//!
//! Both lists are ordered by a monotone registry sequence; moving a stream
//! between them assigns a fresh sequence at the tail. The dirty-list scanner
//! keeps a standing cursor and resumes strictly after it, wrapping at the
//! end, so incremental passes never re-walk what they already visited. The
//! scanner returns a strong reference, so a concurrent teardown cannot free
//! the stream out from under a visit.
//!
//! ## Teardown Waiters
//!
//! Waiters are tagged `External` (a caller in `wait_for_teardown`) or
//! `Internal` (the engine itself waiting to re-create a file mid-teardown).
//! A timed-out waiter unlinks exactly its own record; teardown may already
//! be signaling it, which is harmless because completion is a flag the
//! waiter owns jointly with the list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use tracing::debug;

use crate::buffer::FileKey;
use crate::stream::Stream;
use crate::view::StreamId;

/// Who is waiting for a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaiterKind {
    /// A caller of `wait_for_teardown`; removable on timeout.
    External,
    /// The engine waiting to re-create the file; removable on timeout.
    Internal,
}

struct TeardownWaiter {
    file: FileKey,
    kind: WaiterKind,
    done: Arc<AtomicBool>,
}

enum Entry {
    /// A winner is off building the stream; losers wait on `created`.
    Creating,
    Ready(Arc<Stream>),
}

#[derive(Default)]
struct RegistryInner {
    by_file: HashMap<FileKey, Entry>,
    clean: BTreeMap<u64, Arc<Stream>>,
    dirty: BTreeMap<u64, Arc<Stream>>,
    /// Stream's current list key and whether it sits on the dirty list.
    listed: HashMap<StreamId, (u64, bool)>,
    scan_cursor: u64,
    next_seq: u64,
    next_stream_id: StreamId,
    waiters: Vec<TeardownWaiter>,
}

/// Outcome of a creation attempt.
pub(crate) enum CreateOutcome {
    /// Caller won the race; build the stream and call `finish_create` or
    /// `abort_create`. Carries the allocated stream id.
    Won(StreamId),
    /// An existing stream was adopted; its open count already includes the
    /// caller.
    Adopted(Arc<Stream>),
}

/// Registry of all cached streams.
pub struct StreamRegistry {
    inner: Mutex<RegistryInner>,
    created: Condvar,
    torn_down: Condvar,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            created: Condvar::new(),
            torn_down: Condvar::new(),
        }
    }

    /// Resolves the creation race for `file`. Adoption bumps the stream's
    /// open count under the registry lock (registry before stream state is
    /// the documented order).
    pub(crate) fn begin_create(&self, file: FileKey) -> CreateOutcome {
        let mut inner = self.inner.lock();
        loop {
            match inner.by_file.get(&file) {
                None => {
                    inner.by_file.insert(file, Entry::Creating);
                    let id = inner.next_stream_id;
                    inner.next_stream_id += 1;
                    return CreateOutcome::Won(id);
                }
                Some(Entry::Creating) => {
                    self.created.wait(&mut inner);
                }
                Some(Entry::Ready(stream)) => {
                    let stream = Arc::clone(stream);
                    let mut state = stream.state.lock();
                    match state.lifecycle {
                        crate::stream::Lifecycle::Deleting | crate::stream::Lifecycle::Gone => {
                            // Teardown in flight; wait for it and race again.
                            drop(state);
                            let done = self.register_waiter_locked(
                                &mut inner,
                                file,
                                WaiterKind::Internal,
                            );
                            while !done.load(Ordering::Acquire) {
                                self.torn_down.wait(&mut inner);
                            }
                        }
                        crate::stream::Lifecycle::Active
                        | crate::stream::Lifecycle::LazyDelete => {
                            // A lazy-deleted stream is resurrected by a new
                            // open; the deferred-deletion request is void and
                            // the next close re-evaluates from scratch.
                            state.open_count += 1;
                            state.lifecycle = crate::stream::Lifecycle::Active;
                            state.write_queued = false;
                            state.truncate_pending = None;
                            drop(state);
                            return CreateOutcome::Adopted(stream);
                        }
                    }
                }
            }
        }
    }

    /// Publishes the winner's stream and wakes the losers.
    pub(crate) fn finish_create(&self, stream: Arc<Stream>) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.listed.insert(stream.id(), (seq, false));
        inner.clean.insert(seq, Arc::clone(&stream));
        inner
            .by_file
            .insert(stream.file(), Entry::Ready(stream));
        drop(inner);
        self.created.notify_all();
    }

    /// Un-publishes a failed creation and wakes the losers to race again.
    pub(crate) fn abort_create(&self, file: FileKey) {
        let mut inner = self.inner.lock();
        debug_assert!(matches!(inner.by_file.get(&file), Some(Entry::Creating)));
        inner.by_file.remove(&file);
        drop(inner);
        self.created.notify_all();
    }

    /// The stream cached for `file`, if fully created.
    pub fn get(&self, file: FileKey) -> Option<Arc<Stream>> {
        match self.inner.lock().by_file.get(&file) {
            Some(Entry::Ready(stream)) => Some(Arc::clone(stream)),
            _ => None,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().by_file.len()
    }

    /// Every fully created stream; accounting checks iterate this.
    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.inner
            .lock()
            .by_file
            .values()
            .filter_map(|e| match e {
                Entry::Ready(s) => Some(Arc::clone(s)),
                Entry::Creating => None,
            })
            .collect()
    }

    /// Moves a stream to the dirty list (no-op if already there).
    pub(crate) fn mark_dirty_listed(&self, stream: &Arc<Stream>) {
        let mut inner = self.inner.lock();
        let id = stream.id();
        if let Some(&(seq, dirty)) = inner.listed.get(&id) {
            if dirty {
                return;
            }
            inner.clean.remove(&seq);
            let new_seq = inner.next_seq;
            inner.next_seq += 1;
            inner.listed.insert(id, (new_seq, true));
            inner.dirty.insert(new_seq, Arc::clone(stream));
            debug!(file = stream.file(), "stream moved to dirty list");
        }
    }

    /// Moves a stream back to the clean list (no-op if already there).
    pub(crate) fn mark_clean_listed(&self, stream: &Arc<Stream>) {
        let mut inner = self.inner.lock();
        let id = stream.id();
        if let Some(&(seq, dirty)) = inner.listed.get(&id) {
            if !dirty {
                return;
            }
            inner.dirty.remove(&seq);
            let new_seq = inner.next_seq;
            inner.next_seq += 1;
            inner.listed.insert(id, (new_seq, false));
            inner.clean.insert(new_seq, Arc::clone(stream));
            debug!(file = stream.file(), "stream moved to clean list");
        }
    }

    /// Incremental dirty-list scan: returns the first stream past the
    /// standing cursor (wrapping), advancing the cursor to it. The returned
    /// reference is strong, so teardown cannot race the visit.
    pub fn next_dirty_stream(&self) -> Option<Arc<Stream>> {
        let mut inner = self.inner.lock();
        let cursor = inner.scan_cursor;
        let found = inner
            .dirty
            .range(cursor + 1..)
            .next()
            .or_else(|| inner.dirty.range(..=cursor).next())
            .map(|(&seq, stream)| (seq, Arc::clone(stream)));
        match found {
            Some((seq, stream)) => {
                inner.scan_cursor = seq;
                Some(stream)
            }
            None => None,
        }
    }

    pub fn dirty_stream_count(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    /// Removes a torn-down stream and signals its waiters.
    pub(crate) fn remove(&self, stream: &Arc<Stream>) {
        let mut inner = self.inner.lock();
        let id = stream.id();
        if let Some((seq, dirty)) = inner.listed.remove(&id) {
            if dirty {
                inner.dirty.remove(&seq);
            } else {
                inner.clean.remove(&seq);
            }
        }
        inner.by_file.remove(&stream.file());

        let file = stream.file();
        inner.waiters.retain(|w| {
            if w.file == file {
                w.done.store(true, Ordering::Release);
                false
            } else {
                true
            }
        });
        drop(inner);
        self.torn_down.notify_all();
        // A create may be waiting for this teardown.
        self.created.notify_all();
    }

    fn register_waiter_locked(
        &self,
        inner: &mut RegistryInner,
        file: FileKey,
        kind: WaiterKind,
    ) -> Arc<AtomicBool> {
        let done = Arc::new(AtomicBool::new(false));
        inner.waiters.push(TeardownWaiter {
            file,
            kind,
            done: Arc::clone(&done),
        });
        done
    }

    /// Blocks until `file`'s stream is torn down, or the timeout passes.
    /// Returns true when teardown completed (including "was never cached").
    /// A timed-out waiter removes only its own record; an in-flight teardown
    /// signaling it concurrently is unaffected.
    pub fn wait_for_teardown(&self, file: FileKey, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        if !inner.by_file.contains_key(&file) {
            return true;
        }

        let done = self.register_waiter_locked(&mut inner, file, WaiterKind::External);
        loop {
            if done.load(Ordering::Acquire) {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.torn_down.wait_until(&mut inner, deadline).timed_out() {
                        if done.load(Ordering::Acquire) {
                            return true;
                        }
                        inner.waiters.retain(|w| !Arc::ptr_eq(&w.done, &done));
                        return false;
                    }
                }
                None => self.torn_down.wait(&mut inner),
            }
        }
    }

    /// External waiters currently parked (tests peek at this).
    pub fn waiter_count(&self) -> usize {
        self.inner
            .lock()
            .waiters
            .iter()
            .filter(|w| w.kind == WaiterKind::External)
            .count()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
