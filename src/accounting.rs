//! # Dirty-Page Accounting and Write Admission
//!
//! Tracks how many cache pages are dirty (globally here, per stream on the
//! stream objects) and throttles writers once the total approaches a
//! threshold. Every dirtying transition charges the counters exactly once and
//! every cleaning transition (write-back, purge, truncation, teardown)
//! discharges them exactly once; the resulting equality
//!
//! ```text
//! global dirty == Σ stream dirty == Σ buffer/mask dirty contributions
//! ```
//!
//! is the system's central invariant and is re-checked by the engine's
//! `dirty_totals` after every mutating test step.
//!
//! ## Write Admission
//!
//! A write request is charged `min(spanned pages, WRITE_CHARGE_CAP_PAGES)`
//! so one giant write is judged by the same yardstick as everyone else. The
//! request is admitted immediately when the projected total stays under the
//! threshold *and* nobody is already queued; otherwise it joins a FIFO of
//! deferred writes that is replayed as cleaning frees pages. Queued blockers
//! wake in order: a late small write cannot jump a waiting large one.
//!
//! ## Threshold Auto-Detection
//!
//! With no explicit threshold the accountant allows dirty data to cover an
//! eighth of system RAM, measured once per process via `sysinfo`, with a
//! floor for machines reporting implausibly little memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use sysinfo::System;
use tracing::{debug, trace};

use crate::config::{
    DIRTY_THRESHOLD_RAM_FRACTION, MIN_DIRTY_THRESHOLD_PAGES, PAGE_SHIFT, PAGE_SIZE,
    WRITE_CHARGE_CAP_PAGES,
};

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

/// Number of whole pages touched by the byte range `[offset, offset + len)`.
pub fn pages_spanned(offset: u64, len: u64) -> usize {
    if len == 0 {
        return 0;
    }
    let first = offset >> PAGE_SHIFT;
    let last = (offset + len - 1) >> PAGE_SHIFT;
    (last - first + 1) as usize
}

struct Ticket {
    charge: usize,
}

#[derive(Default)]
struct ThrottleQueue {
    deferred: Vec<Arc<Ticket>>,
}

/// Global dirty-page counter plus the deferred-write admission queue.
pub struct DirtyAccountant {
    threshold_pages: AtomicUsize,
    global_dirty: AtomicUsize,
    throttle: Mutex<ThrottleQueue>,
    admitted: Condvar,
}

impl DirtyAccountant {
    /// Threshold from total system RAM: dirty data may cover
    /// `1 / DIRTY_THRESHOLD_RAM_FRACTION` of it.
    pub fn auto_detect() -> Self {
        let total_memory = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });

        let pages = (total_memory / DIRTY_THRESHOLD_RAM_FRACTION) / PAGE_SIZE;
        Self::with_threshold(pages)
    }

    /// Explicit threshold in pages, clamped to the floor.
    pub fn with_threshold(threshold_pages: usize) -> Self {
        Self {
            threshold_pages: AtomicUsize::new(threshold_pages.max(MIN_DIRTY_THRESHOLD_PAGES)),
            global_dirty: AtomicUsize::new(0),
            throttle: Mutex::new(ThrottleQueue::default()),
            admitted: Condvar::new(),
        }
    }

    pub fn threshold_pages(&self) -> usize {
        self.threshold_pages.load(Ordering::Acquire)
    }

    pub fn global_dirty(&self) -> usize {
        self.global_dirty.load(Ordering::Acquire)
    }

    /// Records `pages` newly dirtied pages.
    pub fn charge(&self, pages: usize) {
        if pages == 0 {
            return;
        }
        self.global_dirty.fetch_add(pages, Ordering::AcqRel);
    }

    /// Records `pages` pages cleaned, and replays the deferred queue.
    pub fn discharge(&self, pages: usize) {
        if pages == 0 {
            return;
        }
        loop {
            let current = self.global_dirty.load(Ordering::Acquire);
            debug_assert!(current >= pages, "dirty-page counter underflow");
            let next = current.saturating_sub(pages);
            match self.global_dirty.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(_) => continue,
            }
        }

        // Freed pages may admit a deferred writer; wake them to re-check.
        let queue = self.throttle.lock();
        if !queue.deferred.is_empty() {
            drop(queue);
            self.admitted.notify_all();
        }
    }

    fn fits(&self, charge: usize) -> bool {
        self.global_dirty() + charge <= self.threshold_pages()
    }

    /// Write admission. Returns true once the write may proceed. A
    /// non-blocking call returns false instead of queueing; a blocking call
    /// joins the FIFO and sleeps until replay admits it.
    pub fn can_write(&self, offset: u64, len: u64, nonblocking: bool) -> bool {
        let charge = pages_spanned(offset, len).min(WRITE_CHARGE_CAP_PAGES);

        let mut queue = self.throttle.lock();
        if queue.deferred.is_empty() && self.fits(charge) {
            return true;
        }
        if nonblocking {
            trace!(offset, len, charge, "write deferred (non-blocking)");
            return false;
        }

        debug!(offset, len, charge, "write deferred behind dirty threshold");
        let ticket = Arc::new(Ticket { charge });
        queue.deferred.push(Arc::clone(&ticket));

        loop {
            let at_front = queue
                .deferred
                .first()
                .map(|t| Arc::ptr_eq(t, &ticket))
                .unwrap_or(false);
            if at_front && self.fits(ticket.charge) {
                queue.deferred.remove(0);
                // The next ticket may fit too.
                self.admitted.notify_all();
                return true;
            }
            self.admitted.wait(&mut queue);
        }
    }

    /// Deferred writers currently queued.
    pub fn deferred_writes(&self) -> usize {
        self.throttle.lock().deferred.len()
    }
}

impl Default for DirtyAccountant {
    fn default() -> Self {
        Self::auto_detect()
    }
}
